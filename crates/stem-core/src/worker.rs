//! Worker protocol - 子プロセス側と親プロセス側
//!
//! One request, one response, each framed as an [`Envelope`] whose meta holds
//! the message:
//! - request: `{"task": "<path>", "meta": {...}, "routing": "overlay"}`
//! - response: tagged by `status` (`ok`, `not_found`, `dependencies_error`,
//!   `meta_error`, `invocation_error`). An `ok` response also carries `kind`,
//!   so a sequence drained into an array is a sequence again on the parent side.
//!
//! The child side ([`serve`]) executes with a sequential [`TaskMaster`]. The
//! parent side ([`call`]) spawns the child, writes the request to its stdin
//! and reads the response from its stdout. Logs go to stderr only.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Envelope, EnvelopeError};
use crate::error::StemError;
use crate::master::{TaskError, TaskMaster};
use crate::meta::{Meta, MetaRouting};
use crate::runner::{SequentialRunner, WorkerCommand};
use crate::task::{Data, Sequence};
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: String,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub routing: MetaRouting,
}

/// Which [`Data`] variant an `ok` value was produced as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    #[default]
    Value,
    Seq,
}

impl DataKind {
    pub fn of(data: &Data) -> Self {
        match data {
            Data::Value(_) => DataKind::Value,
            Data::Seq(_) => DataKind::Seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok {
        value: Value,
        #[serde(default)]
        kind: DataKind,
    },
    NotFound { task: String },
    DependenciesError { errors: Value },
    MetaError { errors: Value },
    InvocationError { message: String },
}

impl WorkerResponse {
    /// The value of an `ok` response; every other status becomes an error.
    pub fn into_value(self) -> anyhow::Result<Value> {
        match self {
            WorkerResponse::Ok { value, .. } => Ok(value),
            WorkerResponse::NotFound { task } => Err(anyhow!("worker could not find task '{task}'")),
            WorkerResponse::DependenciesError { errors } => Err(anyhow!("worker reported dependency errors: {errors}")),
            WorkerResponse::MetaError { errors } => Err(anyhow!("worker reported meta errors: {errors}")),
            WorkerResponse::InvocationError { message } => Err(anyhow!(message)),
        }
    }

    /// Like [`WorkerResponse::into_value`], restoring the variant the child
    /// produced.
    pub fn into_data(self) -> anyhow::Result<Data> {
        match self {
            WorkerResponse::Ok {
                value: Value::Array(items),
                kind: DataKind::Seq,
            } => Ok(Data::Seq(Sequence::new(items))),
            WorkerResponse::Ok { kind: DataKind::Seq, .. } => Err(anyhow!("worker sent a sequence that is not an array")),
            other => other.into_value().map(Data::Value),
        }
    }
}

fn to_meta<T: Serialize>(message: &T) -> Result<Value, StemError> {
    serde_json::to_value(message).map_err(|err| StemError::Envelope(EnvelopeError::Json(err)))
}

fn from_meta<T: for<'de> Deserialize<'de>>(meta: Value) -> Result<T, StemError> {
    serde_json::from_value(meta).map_err(|err| StemError::Envelope(EnvelopeError::Json(err)))
}

/// Executes one request against `workspace`.
pub fn handle(workspace: &Workspace, request: &WorkerRequest) -> WorkerResponse {
    let master = TaskMaster::new().with_runner(SequentialRunner::new(request.routing));

    let result = match master.execute_path(&request.meta, &request.task, workspace) {
        Ok(result) => result,
        Err(StemError::TaskNotFound(task, _)) => return WorkerResponse::NotFound { task },
        Err(err) => {
            return WorkerResponse::InvocationError {
                message: err.to_string(),
            };
        }
    };

    match result.data() {
        Ok(data) => WorkerResponse::Ok {
            kind: DataKind::of(&data),
            value: data.into_value(),
        },
        Err(TaskError::Dependencies(errors)) => WorkerResponse::DependenciesError {
            errors: serde_json::to_value(errors).unwrap_or(Value::Null),
        },
        Err(TaskError::Meta(errors)) => WorkerResponse::MetaError {
            errors: serde_json::to_value(errors).unwrap_or(Value::Null),
        },
        Err(TaskError::Invocation(err)) => WorkerResponse::InvocationError {
            message: err.to_string(),
        },
    }
}

/// Child side: read one request from `input`, answer on `output`.
pub fn serve(workspace: &Workspace, input: &mut impl Read, output: &mut impl Write) -> Result<(), StemError> {
    let request: WorkerRequest = from_meta(Envelope::read(input)?.meta)?;
    tracing::debug!(task = %request.task, "worker received request");

    let response = handle(workspace, &request);
    tracing::debug!(task = %request.task, ok = matches!(response, WorkerResponse::Ok { .. }), "worker answering");

    Envelope::meta_only(to_meta(&response)?).write_to(output)?;
    Ok(())
}

/// Parent side: run `request` in a fresh child process.
///
/// The child is always waited on, including when the request cannot be sent.
pub fn call(command: &WorkerCommand, request: &WorkerRequest) -> Result<WorkerResponse, StemError> {
    let envelope = Envelope::meta_only(to_meta(request)?);

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;
    tracing::debug!(pid = child.id(), task = %request.task, "worker spawned");

    if let Err(err) = send(&mut child, &envelope) {
        abandon(&mut child);
        return Err(err);
    }

    let Some(mut stdout) = child.stdout.take() else {
        abandon(&mut child);
        return Err(StemError::Worker("child stdout is not piped".into()));
    };
    let response = Envelope::read(&mut stdout);
    let status = child.wait()?;

    match response {
        Ok(envelope) => from_meta(envelope.meta),
        Err(err) => Err(StemError::Worker(format!("no response from worker ({status}): {err}"))),
    }
}

// stdin is closed on return, so the child sees EOF after the request.
fn send(child: &mut Child, envelope: &Envelope) -> Result<(), StemError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| StemError::Worker("child stdin is not piped".into()))?;
    envelope.write_to(&mut stdin)?;
    Ok(())
}

fn abandon(child: &mut Child) {
    // fails only if the child already exited, which wait() still reaps
    let _ = child.kill();
    match child.wait() {
        Ok(status) => tracing::warn!(pid = child.id(), %status, "worker abandoned"),
        Err(err) => tracing::warn!(pid = child.id(), error = %err, "worker could not be reaped"),
    }
}
