/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Drives a single job through its phases: stage the inputs into the scratch
 * directory, run the command on the build host, collect the outputs, and then
 * clean up.  The cancel marker is checked before each phase and on every poll
 * tick while a phase is in progress.
 */

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use asyncbuild_types::{ErrorKind, JobRequest};
#[allow(unused_imports)]
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::fs::FsGateway;
use super::paths::{self, Output, Resolver, Staging};
use super::remote::{RemoteCommand, RemoteExecutor};
use super::store::JobId;
use super::unix::LocalUser;

const MSG_PREPARE_START: &str = "Start to prepare the work environment\n";
const MSG_PREPARE_DONE: &str = "Finished to work environment preparation\n";

/**
 * Everything a job needs from the service, shared by all jobs.
 */
pub struct Env {
    pub host: String,
    pub fs: Arc<dyn FsGateway>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub poll: Duration,
    pub sync: Duration,
}

pub struct Job {
    pub id: JobId,
    pub user: LocalUser,
    pub scratch: PathBuf,
    pub req: JobRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Completed,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum JobFailure {
    #[error("preparing work environment: {0:#}")]
    Init(anyhow::Error),
    #[error("running command: {0:#}")]
    Run(anyhow::Error),
    #[error("collecting output: {0:#}")]
    Output(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobFailure {
    /**
     * The classification reported to clients.  Anything outside the three
     * phases is reported as an error without a message.
     */
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            JobFailure::Init(_) => Some(ErrorKind::Init),
            JobFailure::Run(_) => Some(ErrorKind::Run),
            JobFailure::Output(_) => Some(ErrorKind::Output),
            JobFailure::Other(_) => None,
        }
    }
}

enum Stage {
    Continue,
    Cancelled,
}

/**
 * Periodically copies the auto-sync outputs back to the user while the
 * command runs, so that they can watch progress.
 */
struct Uploader {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Uploader {
    fn start(
        log: &Logger,
        fs: Arc<dyn FsGateway>,
        outputs: Arc<Vec<Output>>,
        every: Duration,
    ) -> Uploader {
        let (stop, mut rx) = oneshot::channel::<()>();
        let log = log.new(o!("component" => "sync"));

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = tick.tick() => {
                        let log0 = log.clone();
                        let fs0 = Arc::clone(&fs);
                        let outputs0 = Arc::clone(&outputs);
                        let res = tokio::task::spawn_blocking(move || {
                            sync_outputs(&log0, fs0.as_ref(), &outputs0)
                        })
                        .await;
                        if let Err(e) = res {
                            error!(log, "sync task failed: {e}");
                        }
                    }
                }
            }
        });

        Uploader { stop, task }
    }

    /**
     * Stop the uploader, waiting for any pass already under way.
     */
    async fn stop(self, log: &Logger) {
        self.stop.send(()).ok();
        if let Err(e) = self.task.await {
            error!(log, "sync task failed: {e}");
        }
    }
}

/**
 * Copy each auto-sync output whose source exists.  Failures are logged, as
 * the next pass will try again.
 */
fn sync_outputs(log: &Logger, fs: &dyn FsGateway, outputs: &[Output]) {
    for o in outputs.iter().filter(|o| o.auto_sync) {
        let Some(src) = o.src.as_deref() else {
            continue;
        };
        if !fs.path_exists(src) {
            continue;
        }
        if let Err(e) = fs.upload_file(src, &o.dst) {
            warn!(log, "sync {src:?} -> {:?}: {e:#}", o.dst);
        }
    }
}

struct Runner<'a> {
    env: &'a Env,
    job: &'a Job,
    marker: PathBuf,
    pid_file: PathBuf,
    stdout: PathBuf,
    staging: Vec<Staging>,
    outputs: Arc<Vec<Output>>,
}

impl<'a> Runner<'a> {
    fn new(env: &'a Env, job: &'a Job) -> Runner<'a> {
        let r = Resolver::new(&job.scratch, &job.req.user.user_workspace);

        Runner {
            env,
            job,
            marker: paths::cancel_marker(&job.scratch, &env.host),
            pid_file: paths::pid_file(&job.scratch, &env.host),
            stdout: r.resolve(&job.req.run.stdout),
            staging: job
                .req
                .prepare
                .workspace
                .iter()
                .map(|sp| r.staging(sp))
                .collect(),
            outputs: Arc::new(
                job.req.output.iter().map(|o| r.output(o)).collect(),
            ),
        }
    }

    fn cancelled(&self) -> bool {
        self.marker.exists()
    }

    fn ticker(&self) -> Interval {
        let mut tick = tokio::time::interval(self.env.poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    }

    fn open_log(&self) -> Result<File> {
        /*
         * The log may live in a subdirectory of the scratch area that no
         * staging pair has created.  Anywhere else, the directory must
         * already exist.
         */
        if self.stdout.starts_with(&self.job.scratch) {
            if let Some(parent) = self.stdout.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("mkdir {parent:?}"))?;
            }
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.stdout)
            .with_context(|| format!("opening log {:?}", self.stdout))
    }

    async fn work(
        &self,
        log: &Logger,
        uploader: &mut Option<Uploader>,
    ) -> Result<Finish, JobFailure> {
        if self.cancelled() {
            info!(log, "cancelled before start");
            return Ok(Finish::Cancelled);
        }

        let mut lf = self.open_log().map_err(JobFailure::Init)?;
        lf.write_all(MSG_PREPARE_START.as_bytes())
            .map_err(|e| JobFailure::Init(e.into()))?;

        if let Stage::Cancelled = self.prepare(log).await? {
            return Ok(Finish::Cancelled);
        }

        lf.write_all(MSG_PREPARE_DONE.as_bytes())
            .map_err(|e| JobFailure::Init(e.into()))?;

        if self.cancelled() {
            info!(log, "cancelled after preparation");
            return Ok(Finish::Cancelled);
        }

        if self.outputs.iter().any(|o| o.auto_sync) {
            *uploader = Some(Uploader::start(
                log,
                Arc::clone(&self.env.fs),
                Arc::clone(&self.outputs),
                self.env.sync,
            ));
        }

        if let Stage::Cancelled = self.execute(log, lf).await? {
            return Ok(Finish::Cancelled);
        }

        self.collect(log).await.map_err(JobFailure::Output)?;

        Ok(Finish::Completed)
    }

    async fn prepare(&self, log: &Logger) -> Result<Stage, JobFailure> {
        let abort = Arc::new(AtomicBool::new(false));

        let mut task = {
            let fs = Arc::clone(&self.env.fs);
            let staging = self.staging.clone();
            let marker = self.marker.clone();
            let abort = Arc::clone(&abort);
            let log = log.clone();

            tokio::task::spawn_blocking(move || -> Result<()> {
                let stop =
                    || abort.load(Ordering::Relaxed) || marker.exists();

                for s in staging {
                    if !fs.path_exists(&s.src) {
                        bail!("staging source {:?} does not exist", s.src);
                    }
                    if !fs.path_isdir(&s.src) {
                        bail!("staging source {:?} is not a directory", s.src);
                    }

                    debug!(log, "staging {:?} -> {:?}", s.src, s.dst);
                    fs.download_directory(&s.src, &s.dst, &stop)?;
                }

                Ok(())
            })
        };

        let mut tick = self.ticker();
        let res = loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.cancelled() {
                        break None;
                    }
                }
                res = &mut task => break Some(res),
            }
        };

        match res {
            None => {
                info!(log, "cancelled during preparation");
                abort.store(true, Ordering::Relaxed);
                task.await.ok();
                Ok(Stage::Cancelled)
            }
            Some(Ok(Ok(()))) => Ok(Stage::Continue),
            Some(Ok(Err(_))) if self.cancelled() => {
                /*
                 * The copy noticed the marker before we did.
                 */
                info!(log, "cancelled during preparation");
                Ok(Stage::Cancelled)
            }
            Some(Ok(Err(e))) => Err(JobFailure::Init(e)),
            Some(Err(e)) => {
                Err(JobFailure::Init(anyhow!("staging task failed: {e}")))
            }
        }
    }

    async fn execute(
        &self,
        log: &Logger,
        lf: File,
    ) -> Result<Stage, JobFailure> {
        let rc = RemoteCommand {
            cmd: self.job.req.run.cmd.clone(),
            script: self.job.req.run.script.as_bytes().to_vec(),
            workdir: self.job.scratch.clone(),
            pid_file: self.pid_file.clone(),
        };

        let mut run =
            self.env.remote.start(log, rc, lf).map_err(JobFailure::Run)?;

        let mut tick = self.ticker();
        let res = loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.cancelled() {
                        break None;
                    }
                }
                res = run.wait() => break Some(res),
            }
        };

        match res {
            None => {
                info!(log, "cancelled while running");
                run.abandon().await;
                Ok(Stage::Cancelled)
            }
            Some(Ok(0)) => Ok(Stage::Continue),
            Some(Ok(code)) => {
                Err(JobFailure::Run(anyhow!("command exited with code {code}")))
            }
            Some(Err(e)) => Err(JobFailure::Run(e)),
        }
    }

    async fn collect(&self, log: &Logger) -> Result<()> {
        let fs = Arc::clone(&self.env.fs);
        let outputs = Arc::clone(&self.outputs);
        let log = log.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            for o in outputs.iter() {
                let Some(src) = o.src.as_deref() else {
                    continue;
                };
                if !fs.path_exists(src) {
                    debug!(log, "output {src:?} not produced");
                    continue;
                }
                fs.upload_file(src, &o.dst)?;
            }
            Ok(())
        })
        .await?
    }

    /**
     * Runs however the job ended.  Nothing here can fail the job.
     */
    async fn finish(&self, log: &Logger, uploader: Option<Uploader>) {
        if let Some(u) = uploader {
            u.stop(log).await;
        }

        let fs = Arc::clone(&self.env.fs);
        let outputs = Arc::clone(&self.outputs);
        let scratch = self.job.scratch.clone();
        let (uid, gid) = (self.job.user.uid, self.job.user.gid);
        let log0 = log.clone();

        let res = tokio::task::spawn_blocking(move || {
            let log = &log0;

            sync_outputs(log, fs.as_ref(), &outputs);

            /*
             * Whatever we delivered to the user belongs to the user.
             */
            for o in outputs.iter() {
                if !fs.path_exists(&o.dst) {
                    continue;
                }
                if let Err(e) = fs.chown(&o.dst, uid, gid) {
                    warn!(log, "chown {:?} to {uid}:{gid}: {e:#}", o.dst);
                }
            }

            match std::fs::remove_dir_all(&scratch) {
                Ok(()) => debug!(log, "removed scratch {scratch:?}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => warn!(log, "removing scratch {scratch:?}: {e}"),
            }
        })
        .await;

        if let Err(e) = res {
            error!(log, "cleanup task failed: {e}");
        }
    }
}

/**
 * Run a job to completion.  The scratch directory is gone by the time this
 * returns, whatever the outcome.
 */
pub async fn run(
    log: &Logger,
    env: &Env,
    job: &Job,
) -> Result<Finish, JobFailure> {
    let r = Runner::new(env, job);

    let mut uploader = None;
    let res = r.work(log, &mut uploader).await;
    r.finish(log, uploader).await;

    res
}
