/*
 * Copyright 2024 Oxide Computer Company
 */

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Context, Result};

/**
 * The operations used to move files into and out of a job's scratch
 * directory.  The bundled implementation works on the local file system; a
 * deployment that reaches user storage over the network provides its own.
 */
pub trait FsGateway: Send + Sync {
    fn path_exists(&self, p: &Path) -> bool;

    fn path_isdir(&self, p: &Path) -> bool;

    /**
     * Mirror the directory tree at "src" into "dst", creating "dst" if needed
     * and merging into it otherwise.  The "stop" check is consulted between
     * entries; when it returns true the copy is abandoned with an error.
     */
    fn download_directory(
        &self,
        src: &Path,
        dst: &Path,
        stop: &dyn Fn() -> bool,
    ) -> Result<()>;

    /**
     * Copy "src" to "dst".  The source must exist.
     */
    fn upload_file(&self, src: &Path, dst: &Path) -> Result<()>;

    fn chown(&self, p: &Path, uid: u32, gid: u32) -> Result<()>;
}

pub struct LocalFs;

impl LocalFs {
    fn mirror(
        &self,
        src: &Path,
        dst: &Path,
        avoid: &Path,
        stop: &dyn Fn() -> bool,
    ) -> Result<()> {
        match fs::symlink_metadata(dst) {
            Ok(md) if md.is_dir() => (),
            Ok(_) => bail!("{dst:?} exists and is not a directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir(dst)
                    .with_context(|| format!("mkdir {dst:?}"))?;
            }
            Err(e) => return Err(anyhow!("stat {dst:?}: {e}")),
        }

        let rd = fs::read_dir(src).with_context(|| format!("read {src:?}"))?;
        for ent in rd {
            if stop() {
                bail!("copy of {src:?} stopped");
            }

            let ent = ent.with_context(|| format!("read {src:?}"))?;
            let from = ent.path();
            let to = dst.join(ent.file_name());

            if from == avoid {
                /*
                 * The destination lives inside the source tree.  Descending
                 * into it would copy our own output forever.
                 */
                continue;
            }

            /*
             * Never follow symbolic links while walking user data: a link
             * back up the tree would otherwise send us around in circles.
             */
            let ft = ent
                .file_type()
                .with_context(|| format!("stat {from:?}"))?;
            if ft.is_dir() {
                self.mirror(&from, &to, avoid, stop)?;
            } else if ft.is_file() {
                copy_file(&from, &to)?;
            } else if ft.is_symlink() {
                let target = fs::read_link(&from)
                    .with_context(|| format!("readlink {from:?}"))?;
                if fs::symlink_metadata(&to).is_ok() {
                    remove_path(&to)?;
                }
                std::os::unix::fs::symlink(&target, &to)
                    .with_context(|| format!("symlink {to:?}"))?;
            }
            /*
             * Sockets, FIFOs, and device nodes are not copied.
             */
        }

        Ok(())
    }
}

fn remove_path(p: &Path) -> Result<()> {
    let md = fs::symlink_metadata(p)?;
    if md.is_dir() {
        fs::remove_dir_all(p).with_context(|| format!("remove {p:?}"))?;
    } else {
        fs::remove_file(p).with_context(|| format!("remove {p:?}"))?;
    }
    Ok(())
}

/**
 * Copy a regular file into place without ever writing through whatever is
 * already at "to".  The data goes to a fresh file alongside the destination,
 * which is then renamed over it.  A symbolic link planted at the destination
 * is replaced, never followed.
 */
fn copy_file(from: &Path, to: &Path) -> Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let Some(name) = to.file_name() else {
        bail!("invalid destination {to:?}");
    };
    let mut tmpname = OsString::from(".");
    tmpname.push(name);
    tmpname.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = to.with_file_name(tmpname);

    let res = (|| -> Result<()> {
        let mut r =
            fs::File::open(from).with_context(|| format!("open {from:?}"))?;
        let perms = r.metadata()?.permissions();

        /*
         * create_new() refuses to open an existing path, symbolic links
         * included.
         */
        let mut w = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .with_context(|| format!("create {tmp:?}"))?;
        io::copy(&mut r, &mut w)
            .with_context(|| format!("copy {from:?} -> {tmp:?}"))?;
        w.set_permissions(perms)?;
        drop(w);

        fs::rename(&tmp, to)
            .with_context(|| format!("rename {tmp:?} -> {to:?}"))?;
        Ok(())
    })();

    if res.is_err() {
        fs::remove_file(&tmp).ok();
    }
    res
}

fn make_parent_dirs(p: &Path) -> Result<()> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("mkdir {parent:?}"))?;
        }
    }
    Ok(())
}

impl FsGateway for LocalFs {
    fn path_exists(&self, p: &Path) -> bool {
        fs::symlink_metadata(p).is_ok()
    }

    fn path_isdir(&self, p: &Path) -> bool {
        p.is_dir()
    }

    fn download_directory(
        &self,
        src: &Path,
        dst: &Path,
        stop: &dyn Fn() -> bool,
    ) -> Result<()> {
        if !src.is_dir() {
            bail!("{src:?} is not a directory");
        }

        make_parent_dirs(dst)?;

        /*
         * Work out where the destination will be once it exists, so that we
         * can recognise it if we run into it while walking the source.
         */
        let src = src.canonicalize().with_context(|| format!("{src:?}"))?;
        let avoid = match dst.canonicalize() {
            Ok(p) => p,
            Err(_) => match (dst.parent(), dst.file_name()) {
                (Some(parent), Some(name)) => parent
                    .canonicalize()
                    .with_context(|| format!("{parent:?}"))?
                    .join(name),
                _ => bail!("invalid destination {dst:?}"),
            },
        };
        if avoid == src {
            bail!("cannot mirror {src:?} onto itself");
        }

        self.mirror(&src, &avoid, &avoid, stop)
    }

    fn upload_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let md = fs::metadata(src).with_context(|| format!("stat {src:?}"))?;

        make_parent_dirs(dst)?;

        if md.is_dir() {
            self.download_directory(src, dst, &|| false)
        } else {
            copy_file(src, dst)
        }
    }

    fn chown(&self, p: &Path, uid: u32, gid: u32) -> Result<()> {
        let md = fs::symlink_metadata(p)?;
        if md.is_symlink() {
            return Ok(());
        }

        super::unix::chown(p, uid, gid)?;

        if md.is_dir() {
            let mut todo: Vec<PathBuf> = vec![p.to_path_buf()];
            while let Some(dir) = todo.pop() {
                for ent in fs::read_dir(&dir)? {
                    let ent = ent?;
                    let ft = ent.file_type()?;
                    if ft.is_symlink() {
                        continue;
                    }
                    super::unix::chown(ent.path(), uid, gid)?;
                    if ft.is_dir() {
                        todo.push(ent.path());
                    }
                }
            }
        }

        Ok(())
    }
}
