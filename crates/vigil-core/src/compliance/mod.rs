//! Long-lived client to the external compliance module.
//!
//! The client compiles the pushed task calendar against this host's
//! scope, keeps one streaming RPC open per active task set, and drains
//! received task events into the egress path on each control tick. A
//! calendar change diffs task-id sets: an identical set is a no-op, a
//! different one stops the current stream (unary stop, bounded budget)
//! and starts a new one.
//!
//! The stream worker is a tokio task writing into a bounded channel;
//! `tick` drains it non-blockingly, so the control thread never waits on
//! the network except for the explicitly budgeted stop.

pub mod types;

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::types::{
    results_to_wire, CompCalendar, CompTaskEvent, ComplianceRpc, ComplianceRun, ComplianceStart,
    FutureRun, RpcError, RpcReply,
};
use crate::clock;
use crate::config::ComplianceConfig;
use crate::egress::EgressHandler;
use crate::policy::ports::InfrastructureState;

/// Capacity of the stream worker's event channel.
const EVENT_QUEUE_DEPTH: usize = 128;

/// Registered-scope id prefix for compliance tasks.
const SCOPE_PREFIX: &str = "compliance_tasks:";

struct ClientInner {
    calendar: CompCalendar,
    send_results: bool,
    send_events: bool,
    refresh_requested: bool,
    retry_at: Option<Instant>,

    cur_task_ids: BTreeSet<u64>,
    worker: Option<JoinHandle<Result<(), RpcError>>>,
    events_rx: Option<mpsc::Receiver<CompTaskEvent>>,

    pending_run: Option<ComplianceRun>,
    run_future: Option<JoinHandle<RpcReply>>,

    rpc_errors: u64,
    dropped_event_rows: u64,
    task_errors: HashMap<String, Vec<String>>,
}

/// The compliance client; see the module docs.
pub struct ComplianceClient {
    cfg: ComplianceConfig,
    machine_id: String,
    customer_id: String,
    rpc: std::sync::Arc<dyn ComplianceRpc>,
    infra: Option<std::sync::Arc<dyn InfrastructureState>>,
    egress: std::sync::Arc<EgressHandler>,
    runtime: Handle,
    inner: Mutex<ClientInner>,
}

impl ComplianceClient {
    /// Creates an idle client.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &ComplianceConfig,
        machine_id: impl Into<String>,
        customer_id: impl Into<String>,
        rpc: std::sync::Arc<dyn ComplianceRpc>,
        infra: Option<std::sync::Arc<dyn InfrastructureState>>,
        egress: std::sync::Arc<EgressHandler>,
        runtime: Handle,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            machine_id: machine_id.into(),
            customer_id: customer_id.into(),
            rpc,
            infra,
            egress,
            runtime,
            inner: Mutex::new(ClientInner {
                calendar: CompCalendar::default(),
                send_results: false,
                send_events: false,
                refresh_requested: false,
                retry_at: None,
                cur_task_ids: BTreeSet::new(),
                worker: None,
                events_rx: None,
                pending_run: None,
                run_future: None,
                rpc_errors: 0,
                dropped_event_rows: 0,
                task_errors: HashMap::new(),
            }),
        }
    }

    /// Installs a new calendar. The stream is only restarted if the
    /// scope-filtered task-id set actually changed, checked at the next
    /// tick, so setting the same calendar twice is a no-op.
    pub fn set_calendar(&self, calendar: CompCalendar, send_results: bool, send_events: bool) {
        debug!(tasks = calendar.tasks.len(), "new compliance calendar");
        let mut inner = self.inner.lock().expect("compliance poisoned");
        inner.calendar = calendar;
        inner.send_results = send_results;
        inner.send_events = send_events;
        inner.refresh_requested = true;
    }

    /// Queues a run-now request, fired asynchronously at the next tick.
    pub fn run_now(&self, task_ids: Vec<u64>) {
        let mut inner = self.inner.lock().expect("compliance poisoned");
        inner.pending_run = Some(ComplianceRun { task_ids });
    }

    /// Blocking future-runs query; diagnostic only.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] when the compliance module does.
    pub fn get_future_runs(&self, run: ComplianceRun) -> Result<Vec<FutureRun>, RpcError> {
        self.runtime.block_on(self.rpc.get_future_runs(run))
    }

    /// Task ids currently streaming. Diagnostics and tests.
    #[must_use]
    pub fn current_task_ids(&self) -> BTreeSet<u64> {
        self.inner
            .lock()
            .expect("compliance poisoned")
            .cur_task_ids
            .clone()
    }

    /// Stream and task-init failures observed so far.
    #[must_use]
    pub fn rpc_errors(&self) -> u64 {
        self.inner.lock().expect("compliance poisoned").rpc_errors
    }

    /// Compliance event rows dropped for lack of a wire format.
    #[must_use]
    pub fn dropped_event_rows(&self) -> u64 {
        self.inner
            .lock()
            .expect("compliance poisoned")
            .dropped_event_rows
    }

    /// Per-task initialization error ledger (when `save_errors`).
    #[must_use]
    pub fn task_errors(&self) -> HashMap<String, Vec<String>> {
        self.inner
            .lock()
            .expect("compliance poisoned")
            .task_errors
            .clone()
    }

    /// One control-tick step: drain the stream queue, check the worker,
    /// apply a pending refresh, and fire a pending run-now. The caller
    /// throttles this to roughly once per second.
    pub fn tick(&self, ts_ns: u64) {
        let mut inner = self.inner.lock().expect("compliance poisoned");

        self.drain_task_events(&mut inner, ts_ns);
        self.check_worker(&mut inner);

        let retry_due = inner.retry_at.is_some_and(|at| Instant::now() >= at);
        if inner.refresh_requested || retry_due {
            inner.refresh_requested = false;
            inner.retry_at = None;
            self.refresh_tasks(&mut inner);
        }

        self.check_run_tasks(&mut inner);
    }

    /// Stops the stream and abandons outstanding work.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("compliance poisoned");
        self.stop_stream(&mut inner);
        inner.cur_task_ids.clear();
        if let Some(run) = inner.run_future.take() {
            run.abort();
        }
    }

    fn drain_task_events(&self, inner: &mut ClientInner, ts_ns: u64) {
        let Some(rx) = inner.events_rx.as_mut() else {
            return;
        };

        let mut drained = Vec::new();
        while let Ok(event) = rx.try_recv() {
            drained.push(event);
        }

        for event in drained {
            if !event.init_successful {
                error!(
                    task = %event.task_name,
                    error = event.errstr.as_deref().unwrap_or("unknown"),
                    retry_secs = self.cfg.refresh_interval.as_secs(),
                    "could not initialize compliance task, trying again"
                );
                inner.rpc_errors += 1;
                if self.cfg.save_errors {
                    inner
                        .task_errors
                        .entry(event.task_name.clone())
                        .or_default()
                        .push(event.errstr.clone().unwrap_or_default());
                }
            }

            if inner.send_events && !event.events.is_empty() {
                // No collector message format exists for raw compliance
                // events yet; count them so the gap stays visible.
                inner.dropped_event_rows += event.events.len() as u64;
                debug!(
                    task = %event.task_name,
                    rows = event.events.len(),
                    "compliance events have no wire format, dropping"
                );
            }

            if inner.send_results && !event.results.is_empty() {
                self.egress
                    .comp_results_ready(ts_ns, &results_to_wire(&event.results));
            }
        }
    }

    fn check_worker(&self, inner: &mut ClientInner) {
        let finished = inner.worker.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            return;
        }
        let Some(mut worker) = inner.worker.take() else {
            return;
        };

        match (&mut worker).now_or_never() {
            Some(Ok(Ok(()))) => debug!("compliance stream completed"),
            Some(Ok(Err(err))) => {
                error!(
                    %err,
                    retry_secs = self.cfg.refresh_interval.as_secs(),
                    "could not run compliance stream, trying again"
                );
                inner.rpc_errors += 1;
                inner.retry_at = Some(Instant::now() + self.cfg.refresh_interval);
            },
            Some(Err(join_err)) => {
                warn!(%join_err, "compliance stream worker aborted");
            },
            None => {
                // is_finished was true; the join resolves immediately.
            },
        }
    }

    /// Applies the calendar: scope-filter, diff against the running
    /// set, and restart the stream when the set changed.
    fn refresh_tasks(&self, inner: &mut ClientInner) {
        let mut start = ComplianceStart {
            machine_id: self.machine_id.clone(),
            customer_id: self.customer_id.clone(),
            calendar: CompCalendar::default(),
        };
        let mut new_task_ids = BTreeSet::new();

        for task in &inner.calendar.tasks {
            if !task.enabled {
                continue;
            }

            if let Some(infra) = &self.infra {
                // Register the scope so the inventory re-evaluates it
                // as containers come and go, then gate on the current
                // answer.
                let reg_id = format!("{SCOPE_PREFIX}{}", task.name);
                infra.register_scope(&reg_id, true, true, &task.scope_predicates);
                if !infra.check_registered_scope(&reg_id) {
                    info!(task = %task.name, "not starting compliance task (scope doesn't match)");
                    continue;
                }
            }

            start.calendar.tasks.push(task.clone());
            new_task_ids.insert(task.id);
        }

        if new_task_ids == inner.cur_task_ids {
            info!("compliance tasks unchanged, not doing anything");
            return;
        }

        self.stop_stream(inner);
        inner.cur_task_ids = new_task_ids;

        if !inner.cur_task_ids.is_empty() {
            debug!(tasks = inner.cur_task_ids.len(), "starting compliance tasks");
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            inner.events_rx = Some(rx);
            inner.worker = Some(self.runtime.spawn(self.rpc.start(start, tx)));
        }
    }

    /// Stops the current stream with the unary stop RPC, waiting no
    /// longer than the configured budget; a timeout is logged and the
    /// worker abandoned.
    fn stop_stream(&self, inner: &mut ClientInner) {
        let Some(worker) = inner.worker.take() else {
            return;
        };
        inner.events_rx = None;

        let stop = self.rpc.stop();
        let budget = self.cfg.stop_budget;
        let reply = self
            .runtime
            .block_on(async move { tokio::time::timeout(budget, stop).await });

        match reply {
            Ok(reply) => {
                if !reply.successful {
                    debug!(
                        error = reply.errstr.as_deref().unwrap_or("unknown"),
                        "compliance stop call returned error"
                    );
                }
            },
            Err(_) => {
                error!(
                    budget_secs = budget.as_secs(),
                    "did not receive response to compliance stop call within budget"
                );
            },
        }

        // The worker normally ends when the server closes the stream;
        // after a stop timeout it may hang, so abandon it either way.
        worker.abort();
    }

    fn check_run_tasks(&self, inner: &mut ClientInner) {
        if inner
            .run_future
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            if let Some(mut run) = inner.run_future.take() {
                if let Some(Ok(reply)) = (&mut run).now_or_never() {
                    if !reply.successful {
                        error!(
                            error = reply.errstr.as_deref().unwrap_or("unknown"),
                            "could not run compliance tasks"
                        );
                        inner.rpc_errors += 1;
                    }
                }
            }
        }

        if inner.run_future.is_none() {
            if let Some(run) = inner.pending_run.take() {
                debug!(tasks = run.task_ids.len(), ts = clock::wall_ns(), "running compliance tasks now");
                inner.run_future = Some(self.runtime.spawn(self.rpc.run_tasks(run)));
            }
        }
    }
}

impl std::fmt::Debug for ComplianceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("compliance poisoned");
        f.debug_struct("ComplianceClient")
            .field("machine_id", &self.machine_id)
            .field("tasks", &inner.cur_task_ids.len())
            .field("streaming", &inner.worker.is_some())
            .finish_non_exhaustive()
    }
}
