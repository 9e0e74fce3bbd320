/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Stand-ins for the build host, the file system, and the password database,
 * for use in tests.
 */

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use slog::{o, Logger};
use tempfile::TempDir;

use super::config::ConfigFile;
use super::fs::{FsGateway, LocalFs};
use super::jobs::Jobs;
use super::remote::{
    RemoteCommand, RemoteExecutor, RemoteHelper, RemoteRun, SshExecutor,
};
use super::runner::Env;
use super::unix::{LocalUser, UserDirectory};

pub fn log() -> Logger {
    Logger::root(slog::Discard, o!())
}

/**
 * A temporary directory holding a user's home and workspace, plus a place
 * to put scratch directories.
 */
pub struct Fixture {
    _dir: TempDir,
    pub scratch: PathBuf,
    pub user_workspace: PathBuf,
    pub user: LocalUser,
}

impl Fixture {
    pub fn new() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let home = dir.path().join("home");
        let user_workspace = home.join("work");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&user_workspace)?;
        std::fs::create_dir_all(&scratch)?;

        /*
         * Outputs are handed to the user with chown(2), which we can only do
         * to ourselves without privileges.
         */
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };

        Ok(Fixture {
            _dir: dir,
            scratch,
            user_workspace,
            user: LocalUser { name: "tester".into(), uid, gid, home },
        })
    }

    pub fn user_file(&self, rel: &str, contents: &str) -> Result<()> {
        let p = self.user_workspace.join(rel);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(p, contents)?;
        Ok(())
    }
}

/**
 * A worker pool for build host "build01" with short poll intervals, scratch
 * directories under the fixture, and the fixture user as the only account.
 */
pub fn jobs(f: &Fixture, max_jobs: usize, remote: FakeRemote) -> Arc<Jobs> {
    let cf: ConfigFile = toml::from_str(&format!(
        "async_agent = \"build01\"\nmax_jobs = {max_jobs}\nworkspace = {:?}\n",
        f.scratch.to_string_lossy(),
    ))
    .unwrap();
    cf.check().unwrap();

    let env = Env {
        host: cf.async_agent.to_string(),
        fs: Arc::new(super::fs::LocalFs),
        remote: Arc::new(remote),
        poll: Duration::from_millis(20),
        sync: Duration::from_millis(20),
    };

    Arc::new(Jobs::new(log(), &cf, env, Arc::new(FakeUsers(f.user.clone()))))
}

/**
 * A small job that runs one command and copies its log back to the user.
 */
pub fn request_body(f: &Fixture, user: &str) -> serde_json::Value {
    serde_json::json!({
        "user": { "username": user, "user_workspace": f.user_workspace },
        "run": { "cmd": ["true"], "stdout": "workspace/out.log" },
        "output": [
            { "dst": "MyFolder/out.log", "src": "workspace/out.log" },
        ],
    })
}

pub struct FakeUsers(pub LocalUser);

impl UserDirectory for FakeUsers {
    fn resolve_user(&self, username: &str) -> Result<LocalUser> {
        if username == self.0.name {
            Ok(self.0.clone())
        } else {
            bail!("could not locate user {username:?}");
        }
    }
}

#[derive(Default)]
struct StartedInner {
    count: usize,
    seen: Vec<PathBuf>,
    abandoned: bool,
}

/**
 * What the fake build host has been asked to do.
 */
#[derive(Clone, Default)]
pub struct Started(Arc<Mutex<StartedInner>>);

impl Started {
    pub fn count(&self) -> usize {
        self.0.lock().unwrap().count
    }

    /**
     * Was this file present in the working directory when the most recent
     * command started?
     */
    pub fn saw(&self, rel: &str) -> bool {
        self.0.lock().unwrap().seen.iter().any(|p| p == Path::new(rel))
    }

    pub fn abandoned(&self) -> bool {
        self.0.lock().unwrap().abandoned
    }
}

fn walk(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for ent in std::fs::read_dir(dir)? {
        let ent = ent?;
        let p = ent.path();
        if ent.file_type()?.is_dir() {
            walk(base, &p, out)?;
        } else if let Ok(rel) = p.strip_prefix(base) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/**
 * Pretends to run a command: files are created in the working directory
 * immediately, and then the command either exits with a fixed code or runs
 * until it is abandoned.
 */
pub struct FakeRemote {
    exit: Option<i32>,
    creates: Vec<(String, String)>,
    started: Started,
}

impl FakeRemote {
    pub fn exit(code: i32) -> FakeRemote {
        FakeRemote {
            exit: Some(code),
            creates: Default::default(),
            started: Default::default(),
        }
    }

    pub fn hang() -> FakeRemote {
        FakeRemote {
            exit: None,
            creates: Default::default(),
            started: Default::default(),
        }
    }

    pub fn creates(mut self, rel: &str, contents: &str) -> FakeRemote {
        self.creates.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn started(&self) -> Started {
        self.started.clone()
    }
}

impl RemoteExecutor for FakeRemote {
    fn start(
        &self,
        _log: &Logger,
        cmd: RemoteCommand,
        mut output: std::fs::File,
    ) -> Result<RemoteRun> {
        use std::io::Write;

        let mut seen = Vec::new();
        walk(&cmd.workdir, &cmd.workdir, &mut seen)?;
        {
            let mut s = self.started.0.lock().unwrap();
            s.count += 1;
            s.seen = seen;
        }

        writeln!(output, "fake: {}", cmd.shell_line())?;
        for (rel, contents) in self.creates.iter() {
            std::fs::write(cmd.workdir.join(rel), contents)?;
        }
        std::fs::write(&cmd.pid_file, "4242\n")?;

        let (run, helper) = RemoteRun::channel();
        let exit = self.exit;
        let started = self.started.clone();
        tokio::spawn(async move {
            let RemoteHelper { exit: tx, abandon } = helper;

            if let Some(code) = exit {
                tx.send(Ok(code)).ok();
            } else {
                abandon.await.ok();
                started.0.lock().unwrap().abandoned = true;
                tx.send(Err(anyhow!("remote command abandoned"))).ok();
            }
        });

        Ok(run)
    }
}

/*
 * Runs the last argument, which is the remote command line, with a local
 * shell.  The command goes into the background with the original standard
 * input, as it would on the far side of a real connection, so killing the
 * client does not kill the command.
 */
const SSH_STUB: &str = "#!/bin/sh
for last; do :; done
printf '%s\\n' \"$last\" >> \"$0.calls\"
exec 3<&0
/bin/sh -c \"$last\" <&3 3<&- &
wait $!
";

/**
 * An ssh(1) replacement that runs every remote command on this machine.
 */
pub struct SshStub {
    _dir: TempDir,
    path: PathBuf,
}

impl SshStub {
    pub fn new() -> Result<SshStub> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ssh");
        std::fs::write(&path, SSH_STUB)?;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&path, perms)?;

        Ok(SshStub { _dir: dir, path })
    }

    pub fn executor(&self) -> SshExecutor {
        let cf: ConfigFile = toml::from_str(&format!(
            "async_agent = \"build01\"\nssh = {:?}\n",
            self.path.to_string_lossy(),
        ))
        .unwrap();

        SshExecutor::new(&cf)
    }

    /**
     * The remote command lines run so far, oldest first.
     */
    pub fn calls(&self) -> Vec<String> {
        let mut p = self.path.clone().into_os_string();
        p.push(".calls");
        match std::fs::read_to_string(p) {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCall {
    Upload(PathBuf),
    Chown(PathBuf, u32, u32),
}

/**
 * Works on the local file system, but notes each upload and each change of
 * ownership rather than performing the latter.  A stalled gateway holds each
 * directory copy open until asked to stop.
 */
#[derive(Default)]
pub struct RecordingFs {
    calls: Mutex<Vec<FsCall>>,
    stall: bool,
    copying: AtomicBool,
}

impl RecordingFs {
    pub fn stalled() -> RecordingFs {
        RecordingFs { stall: true, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<FsCall> {
        self.calls.lock().unwrap().clone()
    }

    /**
     * Has a directory copy begun?
     */
    pub fn copying(&self) -> bool {
        self.copying.load(Ordering::Relaxed)
    }
}

impl FsGateway for RecordingFs {
    fn path_exists(&self, p: &Path) -> bool {
        LocalFs.path_exists(p)
    }

    fn path_isdir(&self, p: &Path) -> bool {
        LocalFs.path_isdir(p)
    }

    fn download_directory(
        &self,
        src: &Path,
        dst: &Path,
        stop: &dyn Fn() -> bool,
    ) -> Result<()> {
        self.copying.store(true, Ordering::Relaxed);

        if self.stall {
            let start = Instant::now();
            while !stop() {
                if start.elapsed() > Duration::from_secs(10) {
                    bail!("copy of {src:?} was never stopped");
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            bail!("copy of {src:?} stopped");
        }

        LocalFs.download_directory(src, dst, stop)
    }

    fn upload_file(&self, src: &Path, dst: &Path) -> Result<()> {
        LocalFs.upload_file(src, dst)?;
        self.calls.lock().unwrap().push(FsCall::Upload(dst.to_path_buf()));
        Ok(())
    }

    fn chown(&self, p: &Path, uid: u32, gid: u32) -> Result<()> {
        let call = FsCall::Chown(p.to_path_buf(), uid, gid);
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}
