/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{bail, Result};
use asyncbuild_types::{ErrorKind, JobState, JobStatus};
#[allow(unused_imports)]
use slog::{debug, error, info, warn, Logger};
use uuid::Uuid;

/**
 * Identifies an accepted job.  The external form is "<build host>/<uuid>".
 */
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId {
    host: String,
    uuid: Uuid,
}

impl JobId {
    pub fn new(host: &str, uuid: Uuid) -> JobId {
        JobId { host: host.to_string(), uuid }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    #[cfg(test)]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.uuid.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((host, id)) = s.split_once('/') else {
            bail!("job ID {s:?} has no host component");
        };
        if host.is_empty() || id.contains('/') {
            bail!("job ID {s:?} is ambiguous");
        }

        /*
         * The UUID parser accepts several encodings.  Only the lower-case
         * hyphenated form that we hand out is acceptable, so that there is
         * exactly one spelling of each ID.
         */
        let uuid = Uuid::parse_str(id)?;
        if uuid.hyphenated().to_string() != id {
            bail!("job ID {s:?} is not in canonical form");
        }

        Ok(JobId::new(host, uuid))
    }
}

/**
 * The lifecycle events that drive the record store.
 */
#[derive(Debug, Clone)]
pub enum JobEvent {
    Added { id: JobId, scratch: PathBuf },
    Submitted { id: JobId },
    Executed { id: JobId },
    Error { id: JobId, kind: Option<ErrorKind> },
    /**
     * The runner gave up on the job at the request of the user; every trace
     * of the job is removed.
     */
    Cancelled { id: JobId },
}

impl JobEvent {
    pub fn id(&self) -> &JobId {
        match self {
            JobEvent::Added { id, .. }
            | JobEvent::Submitted { id }
            | JobEvent::Executed { id }
            | JobEvent::Error { id, .. }
            | JobEvent::Cancelled { id } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Added { .. } => "ADDED",
            JobEvent::Submitted { .. } => "SUBMITTED",
            JobEvent::Executed { .. } => "EXECUTED",
            JobEvent::Error { .. } => "ERROR",
            JobEvent::Cancelled { .. } => "CANCELLED",
        }
    }
}

pub trait JobListener: Send + Sync {
    fn job_event(&self, ev: &JobEvent);
}

#[derive(Default)]
struct Inner {
    state: BTreeMap<JobId, JobState>,
    scratch: BTreeMap<JobId, PathBuf>,
    error: BTreeMap<JobId, ErrorKind>,
}

impl Inner {
    fn transition(&mut self, log: &Logger, id: &JobId, next: JobState) -> bool {
        match self.state.get(id).copied() {
            Some(cur) if cur.may_become(next) => {
                self.state.insert(id.clone(), next);
                true
            }
            Some(cur) => {
                warn!(log, "job {id}: ignoring transition {cur} -> {next}");
                false
            }
            None => {
                warn!(log, "job {id}: transition to {next} for unknown job");
                false
            }
        }
    }

    fn drop_scratch(&mut self, log: &Logger, id: &JobId) {
        if let Some(p) = self.scratch.remove(id) {
            match std::fs::remove_dir_all(&p) {
                Ok(()) => debug!(log, "job {id}: removed {p:?}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => error!(log, "job {id}: removing {p:?}: {e}"),
            }
        }
    }
}

/**
 * In-memory job records.  All three maps are only ever touched under the one
 * lock, so each event is applied atomically.
 */
pub struct Store {
    log: Logger,
    inner: Mutex<Inner>,
}

impl Store {
    pub fn new(log: Logger) -> Store {
        Store { log, inner: Default::default() }
    }

    pub fn running(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .state
            .values()
            .filter(|s| s.is_running())
            .count()
    }

    #[cfg(test)]
    pub fn state(&self, id: &JobId) -> Option<JobState> {
        self.inner.lock().unwrap().state.get(id).copied()
    }

    pub fn scratch(&self, id: &JobId) -> Option<PathBuf> {
        self.inner.lock().unwrap().scratch.get(id).cloned()
    }

    /**
     * The error message is only reported for a job in the ERROR state.
     */
    pub fn status(&self, id: &JobId) -> JobStatus {
        let i = self.inner.lock().unwrap();

        match i.state.get(id) {
            Some(JobState::Error) => JobStatus {
                error: i.error.get(id).map(|k| k.message().to_string()),
                status: Some(JobState::Error),
            },
            Some(s) => JobStatus { error: None, status: Some(*s) },
            None => JobStatus::unknown(),
        }
    }

    /**
     * Produce the state of every job, and the scratch directory of every job
     * that still has one, keyed by external job ID.
     */
    pub fn snapshot(
        &self,
    ) -> (BTreeMap<String, JobState>, BTreeMap<String, String>) {
        let i = self.inner.lock().unwrap();

        let status = i.state.iter().map(|(id, s)| (id.to_string(), *s));
        let infos = i
            .scratch
            .iter()
            .map(|(id, p)| (id.to_string(), p.to_string_lossy().to_string()));

        (status.collect(), infos.collect())
    }
}

impl JobListener for Store {
    fn job_event(&self, ev: &JobEvent) {
        let log = &self.log;
        let mut i = self.inner.lock().unwrap();

        match ev {
            JobEvent::Added { id, scratch } => {
                if i.state.contains_key(id) {
                    error!(log, "job {id}: added twice");
                    return;
                }
                i.state.insert(id.clone(), JobState::Pending);
                i.scratch.insert(id.clone(), scratch.clone());
            }
            JobEvent::Submitted { id } => {
                i.transition(log, id, JobState::Submitted);
            }
            JobEvent::Executed { id } => {
                if i.transition(log, id, JobState::Executed) {
                    i.drop_scratch(log, id);
                }
            }
            JobEvent::Error { id, kind } => {
                if i.transition(log, id, JobState::Error) {
                    if let Some(kind) = kind {
                        i.error.insert(id.clone(), *kind);
                    }
                    i.drop_scratch(log, id);
                }
            }
            JobEvent::Cancelled { id } => match i.state.get(id).copied() {
                Some(s) if s.is_running() => {
                    i.drop_scratch(log, id);
                    i.state.remove(id);
                    i.error.remove(id);
                }
                Some(s) => {
                    /*
                     * The job reached a terminal state first.
                     */
                    info!(log, "job {id}: already {s}; cancel has no effect");
                }
                None => (),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn id() -> JobId {
        JobId::new("build01", Uuid::new_v4())
    }

    #[test]
    fn job_id_round_trip() -> Result<()> {
        let id = id();
        let s = id.to_string();
        assert!(s.starts_with("build01/"));
        assert_eq!(s.parse::<JobId>()?, id);
        Ok(())
    }

    #[test]
    fn job_id_rejects_ambiguity() {
        let u = Uuid::new_v4();
        let cases = vec![
            String::new(),
            "build01".to_string(),
            u.hyphenated().to_string(),
            format!("/{}", u.hyphenated()),
            format!("a/b/{}", u.hyphenated()),
            format!("build01/{}", u.simple()),
            format!("build01/{}", u.braced()),
            format!("build01/{}", u.hyphenated().to_string().to_uppercase()),
            "build01/not-a-uuid".to_string(),
        ];

        for should_fail in cases {
            println!("should fail {:?}", should_fail);
            match should_fail.parse::<JobId>() {
                Err(e) => println!("  yes, fail! {:?}", e),
                Ok(res) => panic!("  wanted failure, got {:?}", res),
            }
        }
    }

    #[test]
    fn lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("job");
        std::fs::create_dir(&scratch)?;

        let s = Store::new(log());
        let id = id();

        assert_eq!(s.status(&id), JobStatus::unknown());

        s.job_event(&JobEvent::Added {
            id: id.clone(),
            scratch: scratch.clone(),
        });
        assert_eq!(s.state(&id), Some(JobState::Pending));
        assert_eq!(s.scratch(&id), Some(scratch.clone()));
        assert_eq!(s.running(), 1);

        /*
         * PENDING may not jump straight to EXECUTED.
         */
        s.job_event(&JobEvent::Executed { id: id.clone() });
        assert_eq!(s.state(&id), Some(JobState::Pending));
        assert!(scratch.is_dir());

        s.job_event(&JobEvent::Submitted { id: id.clone() });
        assert_eq!(s.state(&id), Some(JobState::Submitted));
        assert_eq!(s.running(), 1);

        s.job_event(&JobEvent::Executed { id: id.clone() });
        assert_eq!(s.state(&id), Some(JobState::Executed));
        assert_eq!(s.scratch(&id), None);
        assert!(!scratch.exists());
        assert_eq!(s.running(), 0);

        /*
         * Nothing moves a job out of a terminal state.
         */
        s.job_event(&JobEvent::Error { id: id.clone(), kind: None });
        s.job_event(&JobEvent::Submitted { id: id.clone() });
        s.job_event(&JobEvent::Cancelled { id: id.clone() });
        assert_eq!(
            s.status(&id),
            JobStatus { error: None, status: Some(JobState::Executed) }
        );
        Ok(())
    }

    #[test]
    fn classified_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Store::new(log());

        let a = id();
        s.job_event(&JobEvent::Added {
            id: a.clone(),
            scratch: dir.path().join("a"),
        });
        s.job_event(&JobEvent::Submitted { id: a.clone() });
        s.job_event(&JobEvent::Error {
            id: a.clone(),
            kind: Some(ErrorKind::Init),
        });
        assert_eq!(
            s.status(&a),
            JobStatus {
                error: Some("Task init error.".into()),
                status: Some(JobState::Error),
            }
        );

        let b = id();
        s.job_event(&JobEvent::Added {
            id: b.clone(),
            scratch: dir.path().join("b"),
        });
        s.job_event(&JobEvent::Error { id: b.clone(), kind: None });
        assert_eq!(
            s.status(&b),
            JobStatus { error: None, status: Some(JobState::Error) }
        );
        Ok(())
    }

    #[test]
    fn cancelled_job_vanishes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("job");
        std::fs::create_dir(&scratch)?;

        let s = Store::new(log());
        let id = id();
        s.job_event(&JobEvent::Added {
            id: id.clone(),
            scratch: scratch.clone(),
        });
        s.job_event(&JobEvent::Submitted { id: id.clone() });
        s.job_event(&JobEvent::Cancelled { id: id.clone() });

        assert_eq!(s.status(&id), JobStatus::unknown());
        assert_eq!(s.scratch(&id), None);
        assert!(!scratch.exists());

        let (status, infos) = s.snapshot();
        assert!(status.is_empty());
        assert!(infos.is_empty());
        Ok(())
    }

    #[test]
    fn snapshot_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let s = Store::new(log());

        let a = id();
        let b = id();
        s.job_event(&JobEvent::Added {
            id: a.clone(),
            scratch: dir.path().join("a"),
        });
        s.job_event(&JobEvent::Added {
            id: b.clone(),
            scratch: dir.path().join("b"),
        });
        s.job_event(&JobEvent::Submitted { id: b.clone() });
        s.job_event(&JobEvent::Executed { id: b.clone() });

        let (status, infos) = s.snapshot();
        assert_eq!(status.get(&a.to_string()), Some(&JobState::Pending));
        assert_eq!(status.get(&b.to_string()), Some(&JobState::Executed));
        assert_eq!(infos.len(), 1);
        assert_eq!(
            infos.get(&a.to_string()).map(String::as_str),
            Some(dir.path().join("a").to_str().unwrap())
        );
        Ok(())
    }
}
