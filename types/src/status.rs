/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/**
 * Lifecycle state of an accepted job.  States only ever advance in the order
 * listed here, and EXECUTED and ERROR are both terminal.
 */
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Eq, PartialEq,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Submitted,
    Executed,
    Error,
}

impl JobState {
    /**
     * Does a job in this state count against the concurrency cap?
     */
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Submitted)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Submitted => 1,
            JobState::Executed | JobState::Error => 2,
        }
    }

    /**
     * Is moving from this state to "next" a forward transition?  Terminal
     * states accept no further transitions, and PENDING may not jump directly
     * to EXECUTED.
     */
    pub fn may_become(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == JobState::Pending && next == JobState::Executed {
            return false;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Submitted => "SUBMITTED",
            JobState::Executed => "EXECUTED",
            JobState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/**
 * Classified failures, each with a stable numeric code that clients match on.
 */
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    MaxJobsReached,
    Init,
    Run,
    Output,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::InvalidRequest => 9001,
            ErrorKind::MaxJobsReached => 9007,
            ErrorKind::Init => 9015,
            ErrorKind::Run => 9016,
            ErrorKind::Output => 9017,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "Invalid request.",
            ErrorKind::MaxJobsReached => "Maximum number of jobs reached.",
            ErrorKind::Init => "Task init error.",
            ErrorKind::Run => "Task run error.",
            ErrorKind::Output => "Task output error.",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody { code: self.code(), message: self.message().to_string() }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/**
 * Body of a 400 response for a classified failure.
 */
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

/**
 * The view of the whole worker pool returned by a GET on the collection.
 * Both maps are keyed by the external job id.
 */
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct PoolStatus {
    pub host: String,
    pub max_jobs: usize,
    pub running_jobs: usize,
    pub status: BTreeMap<String, JobState>,
    pub infos: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct JobStatus {
    pub error: Option<String>,
    pub status: Option<JobState>,
}

impl JobStatus {
    pub fn unknown() -> JobStatus {
        JobStatus { error: None, status: None }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct HostStatus {
    pub status: Option<JobState>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct JobSubmitResult {
    pub id: String,
}

/**
 * Serialises as an empty JSON object.
 */
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Debug, Default, Eq, PartialEq,
)]
pub struct Empty {}
