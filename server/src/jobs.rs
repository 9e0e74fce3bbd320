/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use asyncbuild_common::*;
use asyncbuild_types::{ErrorKind, JobRequest, JobStatus, PoolStatus};
#[allow(unused_imports)]
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::config::ConfigFile;
use super::paths;
use super::runner::{self, Env, Finish, Job, JobFailure};
use super::store::{JobEvent, JobId, JobListener, Store};
use super::unix::UserDirectory;

#[derive(Error, Debug)]
pub enum AdmitError {
    #[error("maximum of {0} running jobs reached")]
    MaxJobsReached(usize),
    #[error("could not set up job: {0:#}")]
    Init(anyhow::Error),
}

impl AdmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmitError::MaxJobsReached(_) => ErrorKind::MaxJobsReached,
            AdmitError::Init(_) => ErrorKind::Init,
        }
    }
}

/**
 * Logs each lifecycle event as it is published.
 */
struct EventLog(Logger);

impl JobListener for EventLog {
    fn job_event(&self, ev: &JobEvent) {
        debug!(self.0, "job {}: {}", ev.id(), ev.name());
    }
}

/**
 * The worker pool for one build host.  Jobs are admitted here, then wait for
 * one of "max_jobs" worker slots before their runner starts.
 */
pub struct Jobs {
    log: Logger,
    host: String,
    max_jobs: usize,
    namespace: Option<PathBuf>,
    store: Arc<Store>,
    listeners: Vec<Arc<dyn JobListener>>,
    /*
     * Held across the admission check and the insertion of the new record,
     * so that concurrent submissions cannot both squeeze under the cap.
     */
    admission: Mutex<()>,
    workers: Arc<Semaphore>,
    env: Arc<Env>,
    users: Arc<dyn UserDirectory>,
}

impl Jobs {
    pub fn new(
        log: Logger,
        cf: &ConfigFile,
        env: Env,
        users: Arc<dyn UserDirectory>,
    ) -> Jobs {
        let store = Arc::new(Store::new(log.new(o!("component" => "store"))));
        let listeners: Vec<Arc<dyn JobListener>> = vec![
            Arc::clone(&store) as Arc<dyn JobListener>,
            Arc::new(EventLog(log.new(o!("component" => "events")))),
        ];

        Jobs {
            host: env.host.to_string(),
            max_jobs: cf.max_jobs,
            namespace: cf.workspace.clone(),
            store,
            listeners,
            admission: Mutex::new(()),
            workers: Arc::new(Semaphore::new(cf.max_jobs)),
            env: Arc::new(env),
            users,
            log,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn emit(&self, ev: JobEvent) {
        for l in self.listeners.iter() {
            l.job_event(&ev);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let (status, infos) = self.store.snapshot();

        PoolStatus {
            host: self.host.to_string(),
            max_jobs: self.max_jobs,
            running_jobs: self.store.running(),
            status,
            infos,
        }
    }

    /**
     * Look up a job by its external ID.  IDs minted for some other build
     * host, and IDs that do not parse, name jobs we have never seen.
     */
    pub fn job_status(&self, id: &str) -> JobStatus {
        match id.parse::<JobId>() {
            Ok(id) if id.host() == self.host => self.store.status(&id),
            _ => JobStatus::unknown(),
        }
    }

    pub fn add_job(
        self: &Arc<Self>,
        req: JobRequest,
    ) -> Result<JobId, AdmitError> {
        let job = {
            let _g = self.admission.lock().unwrap();

            let running = self.store.running();
            if running >= self.max_jobs {
                warn!(self.log, "rejecting job: {running} jobs running");
                return Err(AdmitError::MaxJobsReached(self.max_jobs));
            }

            let user = self
                .users
                .resolve_user(&req.user.username)
                .map_err(AdmitError::Init)?;

            let uuid = Uuid::new_v4();
            let root = paths::scratch_root(self.namespace.as_deref(), &user);
            let scratch =
                paths::allocate_scratch(&root, uuid).map_err(AdmitError::Init)?;

            let id = JobId::new(&self.host, uuid);
            self.emit(JobEvent::Added {
                id: id.clone(),
                scratch: scratch.clone(),
            });

            Job { id, user, scratch, req }
        };

        let id = job.id.clone();
        info!(self.log, "job {id} accepted";
            "user" => job.user.name.as_str(),
            "scratch" => job.scratch.to_string_lossy().to_string());

        let jobs = Arc::clone(self);
        tokio::spawn(async move {
            jobs.worker(job).await;
        });

        Ok(id)
    }

    async fn worker(self: Arc<Self>, job: Job) {
        let id = job.id.clone();
        let log = self.log.new(o!("job" => id.to_string()));

        let _permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                error!(log, "no worker slot: {e}");
                self.emit(JobEvent::Error { id, kind: None });
                return;
            }
        };

        self.emit(JobEvent::Submitted { id: id.clone() });
        let start = Instant::now();

        /*
         * Run the job in its own task, so that a panic is reported as a failed
         * job rather than leaving the record behind forever.
         */
        let env = Arc::clone(&self.env);
        let rlog = log.clone();
        let res = match tokio::spawn(async move {
            runner::run(&rlog, &env, &job).await
        })
        .await
        {
            Ok(res) => res,
            Err(e) => Err(JobFailure::Other(anyhow::anyhow!("runner: {e}"))),
        };

        let dur = start.elapsed().render();
        match res {
            Ok(Finish::Completed) => {
                info!(log, "job completed in {dur}");
                self.emit(JobEvent::Executed { id });
            }
            Ok(Finish::Cancelled) => {
                info!(log, "job cancelled after {dur}");
                self.emit(JobEvent::Cancelled { id });
            }
            Err(e) => {
                warn!(log, "job failed after {dur}: {e}");
                self.emit(JobEvent::Error { id, kind: e.kind() });
            }
        }
    }

    /**
     * Ask a job to stop by dropping the cancel marker into its scratch
     * directory.  The runner notices at its next check.  A job without a
     * scratch directory has already finished, or never existed.
     */
    pub fn cancel_job(&self, id: &str) {
        let id = match id.parse::<JobId>() {
            Ok(id) if id.host() == self.host => id,
            Ok(_) | Err(_) => {
                info!(self.log, "cancel for unknown job {id:?} ignored");
                return;
            }
        };

        let Some(scratch) = self.store.scratch(&id) else {
            info!(self.log, "job {id} is not running; nothing to cancel");
            return;
        };

        let marker = paths::cancel_marker(&scratch, &self.host);
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&marker)
        {
            Ok(_) => info!(self.log, "job {id}: cancel requested"),
            Err(e) => {
                /*
                 * The job may have finished and removed its scratch directory
                 * in the meantime.
                 */
                warn!(self.log, "job {id}: creating {marker:?}: {e}");
            }
        }
    }

    /**
     * Cancel every job we know about that has not finished.
     */
    pub fn cancel_all(&self) {
        let (status, _) = self.store.snapshot();

        for (id, st) in status {
            if st.is_running() {
                self.cancel_job(&id);
            }
        }
    }
}
