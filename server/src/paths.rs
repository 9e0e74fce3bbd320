/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Resolution of the user-relative path prefixes that appear in a job request,
 * and allocation of the per-job scratch directory those paths resolve into.
 */

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use asyncbuild_types::{OutputSpec, StagePair};
use uuid::Uuid;

use super::unix::LocalUser;

/**
 * Paths with this prefix live in the job's scratch directory.
 */
pub const SCRATCH_PREFIX: &str = "workspace/";

/**
 * Paths with this prefix live in the user's own workspace.
 */
pub const USER_PREFIX: &str = "MyFolder/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    pub src: PathBuf,
    pub dst: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub dst: PathBuf,
    pub src: Option<PathBuf>,
    pub auto_sync: bool,
}

#[derive(Debug, Clone)]
pub struct Resolver {
    scratch: PathBuf,
    user_workspace: PathBuf,
}

impl Resolver {
    pub fn new<S, U>(scratch: S, user_workspace: U) -> Resolver
    where
        S: Into<PathBuf>,
        U: Into<PathBuf>,
    {
        Resolver {
            scratch: scratch.into(),
            user_workspace: user_workspace.into(),
        }
    }

    /**
     * Expand a leading "workspace/" or "MyFolder/".  Only one substitution is
     * made; whatever follows the prefix is used verbatim even if it begins
     * with another prefix.
     */
    pub fn resolve(&self, p: &str) -> PathBuf {
        if let Some(rest) = p.strip_prefix(SCRATCH_PREFIX) {
            self.scratch.join(rest)
        } else if let Some(rest) = p.strip_prefix(USER_PREFIX) {
            self.user_workspace.join(rest)
        } else {
            PathBuf::from(p)
        }
    }

    pub fn staging(&self, sp: &StagePair) -> Staging {
        Staging { src: self.resolve(&sp.src), dst: self.resolve(&sp.dst) }
    }

    pub fn output(&self, o: &OutputSpec) -> Output {
        Output {
            dst: self.resolve(&o.dst),
            src: o.src.as_deref().map(|s| self.resolve(s)),
            auto_sync: o.auto_sync,
        }
    }
}

/**
 * Scratch directories are created under the configured namespace, or in the
 * home directory of the requesting user if there is none.
 */
pub fn scratch_root(namespace: Option<&Path>, user: &LocalUser) -> PathBuf {
    namespace.map(Path::to_path_buf).unwrap_or_else(|| user.home.clone())
}

/**
 * Create a fresh scratch directory for a job.  The directory must not
 * already exist.
 */
pub fn allocate_scratch(root: &Path, id: Uuid) -> Result<PathBuf> {
    if !root.is_absolute() {
        bail!("scratch root {root:?} is not an absolute path");
    }
    std::fs::create_dir_all(root)
        .with_context(|| format!("creating scratch root {root:?}"))?;

    let p = root.join(id.hyphenated().to_string());
    std::fs::create_dir(&p)
        .with_context(|| format!("creating scratch directory {p:?}"))?;
    Ok(p)
}

pub fn cancel_marker(scratch: &Path, host: &str) -> PathBuf {
    scratch.join(format!(".cancel.{host}.job"))
}

pub fn pid_file(scratch: &Path, host: &str) -> PathBuf {
    scratch.join(format!(".pid.{host}.job"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn r() -> Resolver {
        Resolver::new("/scratch/1234", "/home/alice/work")
    }

    #[test]
    fn prefixes() {
        let r = r();
        assert_eq!(
            r.resolve("workspace/in"),
            PathBuf::from("/scratch/1234/in")
        );
        assert_eq!(
            r.resolve("MyFolder/ctx/Dockerfile"),
            PathBuf::from("/home/alice/work/ctx/Dockerfile")
        );
        assert_eq!(r.resolve("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(r.resolve("relative"), PathBuf::from("relative"));
    }

    #[test]
    fn whole_segment_only() {
        let r = r();
        assert_eq!(r.resolve("workspace"), PathBuf::from("workspace"));
        assert_eq!(r.resolve("workspaces/x"), PathBuf::from("workspaces/x"));
        assert_eq!(r.resolve("MyFolderX/y"), PathBuf::from("MyFolderX/y"));
        assert_eq!(r.resolve("a/workspace/b"), PathBuf::from("a/workspace/b"));
    }

    #[test]
    fn substitute_once() {
        let r = r();
        assert_eq!(
            r.resolve("workspace/MyFolder/x"),
            PathBuf::from("/scratch/1234/MyFolder/x")
        );
        assert_eq!(
            r.resolve("MyFolder/workspace/x"),
            PathBuf::from("/home/alice/work/workspace/x")
        );
    }

    #[test]
    fn pairs() {
        let r = r();
        let s = r.staging(&StagePair {
            src: "MyFolder/ctx".into(),
            dst: "workspace/ctx".into(),
        });
        assert_eq!(s.src, PathBuf::from("/home/alice/work/ctx"));
        assert_eq!(s.dst, PathBuf::from("/scratch/1234/ctx"));

        let o = r.output(&OutputSpec {
            dst: "MyFolder/out.log".into(),
            src: None,
            auto_sync: false,
        });
        assert_eq!(o.dst, PathBuf::from("/home/alice/work/out.log"));
        assert_eq!(o.src, None);
    }

    #[test]
    fn scratch_allocation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let user = LocalUser {
            name: "alice".into(),
            uid: 1000,
            gid: 1000,
            home: dir.path().join("home"),
        };

        let root = scratch_root(None, &user);
        assert_eq!(root, user.home);

        let ns = dir.path().join("ns");
        let root = scratch_root(Some(&ns), &user);
        assert_eq!(root, ns);

        let id = Uuid::new_v4();
        let p = allocate_scratch(&root, id)?;
        assert!(p.is_dir());
        assert!(p.starts_with(&ns));
        assert_ne!(p, ns);

        /*
         * The same directory must never be handed out twice.
         */
        assert!(allocate_scratch(&root, id).is_err());

        assert_eq!(
            cancel_marker(&p, "build01"),
            p.join(".cancel.build01.job")
        );
        Ok(())
    }
}
