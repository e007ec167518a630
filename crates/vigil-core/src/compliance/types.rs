//! Compliance data model and RPC port.
//!
//! The compliance module is an external worker reached over a streaming
//! RPC; this crate only compiles calendars, drives the stream lifecycle,
//! and forwards results. The transport itself is behind
//! [`ComplianceRpc`].

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::egress::wire::{CompResultMsg, CompResultsMsg};
use crate::policy::ports::ScopePredicate;

/// One scheduled compliance task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompTask {
    /// Stable task id.
    pub id: u64,

    /// Task name.
    pub name: String,

    /// Disabled tasks are never started.
    pub enabled: bool,

    /// Schedule expression, opaque to the agent.
    pub schedule: String,

    /// Scope predicates deciding whether this host runs the task.
    #[serde(default)]
    pub scope_predicates: Vec<ScopePredicate>,
}

/// The task calendar pushed by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompCalendar {
    /// Tasks in the calendar.
    pub tasks: Vec<CompTask>,
}

/// Start request compiled from the scope-filtered calendar.
#[derive(Debug, Clone)]
pub struct ComplianceStart {
    /// This host's machine id.
    pub machine_id: String,

    /// Customer id.
    pub customer_id: String,

    /// Only the tasks that should actually run on this host.
    pub calendar: CompCalendar,
}

/// One result row from a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompResult {
    /// Task name.
    pub task_name: String,

    /// Task id.
    pub task_id: u64,

    /// Whether the run passed.
    pub successful: bool,

    /// Result summary.
    pub summary: String,
}

/// One event row emitted by a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompEvent {
    /// Task name.
    pub task_name: String,

    /// Event timestamp, nanoseconds.
    pub ts_ns: u64,

    /// Event text.
    pub output: String,
}

/// One message from the compliance stream.
#[derive(Debug, Clone, Default)]
pub struct CompTaskEvent {
    /// Task the message belongs to.
    pub task_name: String,

    /// Whether the task initialized; `false` carries `errstr`.
    pub init_successful: bool,

    /// Initialization error detail.
    pub errstr: Option<String>,

    /// Result rows.
    pub results: Vec<CompResult>,

    /// Event rows.
    pub events: Vec<CompEvent>,
}

/// Run-now request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplianceRun {
    /// Tasks to run immediately.
    pub task_ids: Vec<u64>,
}

/// Reply to the unary stop and run RPCs.
#[derive(Debug, Clone, Default)]
pub struct RpcReply {
    /// Whether the call succeeded.
    pub successful: bool,

    /// Failure detail.
    pub errstr: Option<String>,
}

/// One scheduled future run, for diagnostics.
#[derive(Debug, Clone)]
pub struct FutureRun {
    /// Task name.
    pub task_name: String,

    /// Scheduled time, nanoseconds.
    pub ts_ns: u64,
}

/// Transient compliance RPC failure; the stream is retried after the
/// refresh interval.
#[derive(Debug, Clone, Error)]
#[error("compliance rpc error: {0}")]
pub struct RpcError(pub String);

/// Port to the compliance module's RPC surface.
pub trait ComplianceRpc: Send + Sync {
    /// Opens the streaming start RPC. The future runs until the stream
    /// ends (stop, disconnect, or error), writing received task events
    /// into `events`.
    fn start(
        &self,
        start: ComplianceStart,
        events: mpsc::Sender<CompTaskEvent>,
    ) -> BoxFuture<'static, Result<(), RpcError>>;

    /// Unary stop; the caller enforces the 10-second budget.
    fn stop(&self) -> BoxFuture<'static, RpcReply>;

    /// Unary run-now.
    fn run_tasks(&self, run: ComplianceRun) -> BoxFuture<'static, RpcReply>;

    /// Unary future-runs query (diagnostic only).
    fn get_future_runs(
        &self,
        run: ComplianceRun,
    ) -> BoxFuture<'static, Result<Vec<FutureRun>, RpcError>>;
}

/// Builds the wire batch from drained result rows.
#[must_use]
pub fn results_to_wire(results: &[CompResult]) -> CompResultsMsg {
    CompResultsMsg {
        results: results
            .iter()
            .map(|r| CompResultMsg {
                task_name: r.task_name.clone(),
                task_id: r.task_id,
                successful: r.successful,
                summary: r.summary.clone(),
            })
            .collect(),
    }
}
