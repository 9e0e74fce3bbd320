/*
 * Copyright 2024 Oxide Computer Company
 */

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use asyncbuild_common::*;
use asyncbuild_types::RunCommand;
#[allow(unused_imports)]
use slog::{debug, error, info, warn, Logger};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::config::ConfigFile;

/*
 * How long to wait for the helper to bring down the local end of an
 * abandoned command.
 */
const ABANDON_TIMEOUT: Duration = Duration::from_secs(5);

/**
 * One command to run on the build host.
 */
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub cmd: RunCommand,
    /**
     * Bytes written to the standard input of the command.
     */
    pub script: Vec<u8>,
    pub workdir: PathBuf,
    /**
     * Where the remote shell records the process ID of the command, so that
     * an abandoned command can be signalled.
     */
    pub pid_file: PathBuf,
}

impl RemoteCommand {
    /**
     * Produce the command line for the remote shell: change to the working
     * directory, note our process ID, and replace the shell with the
     * requested command.
     */
    pub fn shell_line(&self) -> String {
        let exec = match &self.cmd {
            RunCommand::Line(l) => format!("exec /bin/sh -c {}", sh_quote(l)),
            RunCommand::Argv(a) => {
                let argv =
                    a.iter().map(|s| sh_quote(s)).collect::<Vec<_>>().join(" ");
                format!("exec {argv}")
            }
        };

        format!(
            "cd {} && echo $$ > {} && {}",
            sh_quote(&self.workdir.to_string_lossy()),
            sh_quote(&self.pid_file.to_string_lossy()),
            exec,
        )
    }
}

/**
 * Handle on a command running on the build host.  The command itself is
 * waited on by a helper task; dropping the handle abandons the command.
 */
pub struct RemoteRun {
    exit: oneshot::Receiver<Result<i32>>,
    abandon: Option<oneshot::Sender<()>>,
}

/**
 * The helper's end of a RemoteRun: it reports the exit code, and learns of
 * abandonment when the receiver fires or its sender is dropped.
 */
pub struct RemoteHelper {
    pub exit: oneshot::Sender<Result<i32>>,
    pub abandon: oneshot::Receiver<()>,
}

impl RemoteRun {
    pub fn channel() -> (RemoteRun, RemoteHelper) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let (abandon_tx, abandon_rx) = oneshot::channel();

        (
            RemoteRun { exit: exit_rx, abandon: Some(abandon_tx) },
            RemoteHelper { exit: exit_tx, abandon: abandon_rx },
        )
    }

    /**
     * Wait for the command to exit, returning its exit code.  This may be
     * used as a branch of select!; it is safe to drop before it completes.
     */
    pub async fn wait(&mut self) -> Result<i32> {
        match (&mut self.exit).await {
            Ok(res) => res,
            Err(_) => bail!("remote command helper went away"),
        }
    }

    /**
     * Ask the helper to give up on the command.  We wait briefly for the local
     * end to come down, but never for the remote process.
     */
    pub async fn abandon(mut self) {
        if let Some(tx) = self.abandon.take() {
            tx.send(()).ok();
        }
        tokio::time::timeout(ABANDON_TIMEOUT, &mut self.exit).await.ok();
    }
}

pub trait RemoteExecutor: Send + Sync {
    /**
     * Start one command on the build host.  Its standard output and standard
     * error are both written to "output".
     */
    fn start(
        &self,
        log: &Logger,
        cmd: RemoteCommand,
        output: std::fs::File,
    ) -> Result<RemoteRun>;
}

/**
 * Runs commands on the build host with the system ssh(1) client.  When a
 * password is configured, sshpass(1) supplies it; otherwise the client uses
 * whatever agent or key-based authentication is available.
 */
#[derive(Clone)]
pub struct SshExecutor {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    ssh: String,
    sshpass: String,
}

impl SshExecutor {
    pub fn new(cf: &ConfigFile) -> SshExecutor {
        SshExecutor {
            host: cf.async_agent.to_string(),
            port: cf.port,
            username: cf.username.clone(),
            password: cf.password.clone(),
            ssh: cf.ssh.to_string(),
            sshpass: cf.sshpass.to_string(),
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "StrictHostKeyChecking=accept-new".to_string(),
            "ConnectTimeout=10".to_string(),
            "ServerAliveInterval=30".to_string(),
            "ServerAliveCountMax=4".to_string(),
            "LogLevel=error".to_string(),
        ];
        if self.password.is_none() {
            opts.push("BatchMode=yes".to_string());
        }
        opts
    }

    pub fn command(&self, remote_line: &str) -> Command {
        let mut cmd = if let Some(pw) = self.password.as_deref() {
            let mut cmd = Command::new(&self.sshpass);
            cmd.env("SSHPASS", pw);
            cmd.arg("-e");
            cmd.arg(&self.ssh);
            cmd
        } else {
            Command::new(&self.ssh)
        };

        for opt in self.ssh_options() {
            cmd.arg("-o").arg(opt);
        }
        cmd.arg("-p").arg(self.port.to_string());
        if let Some(u) = self.username.as_deref() {
            cmd.arg("-l").arg(u);
        }
        cmd.arg(&self.host);
        cmd.arg(remote_line);

        cmd
    }

    /**
     * Fire off a signal to the remote process without waiting to find out
     * whether it arrived.
     */
    fn terminate_remote(&self, log: &Logger, pid: u32) {
        let mut cmd = self.command(&format!("kill -TERM {pid}"));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let log = log.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(30), cmd.output())
                .await
            {
                Ok(Ok(out)) if out.status.success() => {
                    info!(log, "sent SIGTERM to remote pid {pid}");
                }
                Ok(Ok(out)) => {
                    warn!(log, "remote kill of pid {pid}: {}", out.info());
                }
                Ok(Err(e)) => {
                    warn!(log, "remote kill of pid {pid}: {e}");
                }
                Err(_) => {
                    warn!(log, "remote kill of pid {pid} timed out");
                }
            }
        });
    }
}

fn exit_code(es: std::process::ExitStatus) -> i32 {
    if let Some(code) = es.code() {
        code
    } else {
        i32::MAX
    }
}

impl RemoteExecutor for SshExecutor {
    fn start(
        &self,
        log: &Logger,
        rc: RemoteCommand,
        output: std::fs::File,
    ) -> Result<RemoteRun> {
        let line = rc.shell_line();
        debug!(log, "ssh {}: {}", self.host, line);

        let mut cmd = self.command(&line);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::from(output.try_clone()?));
        cmd.stderr(Stdio::from(output));
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning ssh to {}", self.host))?;

        /*
         * The script goes to stdin from its own task: the remote command may
         * not read all of it, or may not read it until much later.
         */
        if let Some(mut stdin) = child.stdin.take() {
            let script = rc.script;
            let log = log.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&script).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        warn!(log, "writing script to remote stdin: {e}");
                    }
                }
                stdin.shutdown().await.ok();
            });
        }

        let (run, helper) = RemoteRun::channel();
        let RemoteHelper { exit, abandon } = helper;
        let log = log.clone();
        let exec = self.clone();
        let pid_file = rc.pid_file;

        tokio::spawn(async move {
            let res = tokio::select! {
                st = child.wait() => {
                    st.map(|st| {
                        if let Some(sig) = st.signal() {
                            warn!(log, "ssh terminated by signal {sig}");
                        }
                        exit_code(st)
                    })
                    .map_err(|e| anyhow!("ssh wait error: {e}"))
                }
                _ = abandon => {
                    /*
                     * Either we were asked to give up, or the handle was
                     * dropped.  Bring down the local client and make a best
                     * effort attempt to stop the remote process.
                     */
                    info!(log, "abandoning remote command");
                    child.start_kill().ok();
                    child.wait().await.ok();

                    match std::fs::read_to_string(&pid_file) {
                        Ok(s) => match s.trim().parse::<u32>() {
                            Ok(pid) => exec.terminate_remote(&log, pid),
                            Err(_) => warn!(log, "bad pid file {pid_file:?}"),
                        },
                        Err(e) => {
                            warn!(log, "could not read {pid_file:?}: {e}");
                        }
                    }

                    Err(anyhow!("remote command abandoned"))
                }
            };

            exit.send(res).ok();
        });

        Ok(run)
    }
}
