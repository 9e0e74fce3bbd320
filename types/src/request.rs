/*
 * Copyright 2024 Oxide Computer Company
 */

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("invalid request: {0}")]
pub struct InvalidRequest(pub String);

macro_rules! invalid {
    ($msg:expr) => {
        return Err(InvalidRequest($msg.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(InvalidRequest(format!($fmt, $($arg)*)))
    }
}

/**
 * A build job submitted to the collection endpoint.
 */
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct JobRequest {
    pub user: JobUser,
    #[serde(default)]
    pub prepare: Prepare,
    pub run: RunSpec,
    #[serde(default)]
    pub output: Vec<OutputSpec>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct JobUser {
    pub username: String,
    pub user_workspace: String,
}

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Debug, Default, Eq, PartialEq,
)]
pub struct Prepare {
    /**
     * Directories to mirror into the job before the command runs, in order.
     */
    #[serde(default)]
    pub workspace: Vec<StagePair>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct StagePair {
    pub src: String,
    pub dst: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct RunSpec {
    pub cmd: RunCommand,
    /**
     * Piped to the standard input of the remote command.
     */
    #[serde(default)]
    pub script: String,
    /**
     * Combined stdout and stderr of the command is appended here.
     */
    pub stdout: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
#[serde(untagged)]
pub enum RunCommand {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Eq, PartialEq)]
pub struct OutputSpec {
    pub dst: String,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default, rename = "auto-sync")]
    pub auto_sync: bool,
}

impl JobRequest {
    /**
     * Parse and check a request body.  Both malformed JSON and a well-formed
     * body that fails a field check are reported the same way.
     */
    pub fn from_slice(body: &[u8]) -> Result<JobRequest, InvalidRequest> {
        let req: JobRequest = serde_json::from_slice(body)
            .map_err(|e| InvalidRequest(e.to_string()))?;
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if self.user.username.trim().is_empty() {
            invalid!("user.username must not be empty");
        }
        if self.user.user_workspace.trim().is_empty() {
            invalid!("user.user_workspace must not be empty");
        }
        if !std::path::Path::new(&self.user.user_workspace).is_absolute() {
            invalid!("user.user_workspace must be an absolute path");
        }

        for (i, p) in self.prepare.workspace.iter().enumerate() {
            if p.src.is_empty() || p.dst.is_empty() {
                invalid!("prepare.workspace[{}] needs both src and dst", i);
            }
        }

        match &self.run.cmd {
            RunCommand::Line(l) if l.trim().is_empty() => {
                invalid!("run.cmd must not be empty");
            }
            RunCommand::Argv(a) if a.first().map_or(true, |s| s.is_empty()) => {
                invalid!("run.cmd must name a program");
            }
            _ => (),
        }
        if self.run.stdout.is_empty() {
            invalid!("run.stdout must not be empty");
        }

        for (i, o) in self.output.iter().enumerate() {
            if o.dst.is_empty() {
                invalid!("output[{}].dst must not be empty", i);
            }
            match o.src.as_deref() {
                Some("") => invalid!("output[{}].src must not be empty", i),
                None if o.auto_sync => {
                    invalid!("output[{}] requests auto-sync without a src", i);
                }
                _ => (),
            }
        }

        Ok(())
    }
}
