//! Compliance client lifecycle: calendar diffs, stream restarts, and
//! result forwarding over a stub RPC.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{CollectSink, StubInfra};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use vigil_core::compliance::types::{
    CompCalendar, CompResult, CompTask, CompTaskEvent, ComplianceRpc, ComplianceRun,
    ComplianceStart, FutureRun, RpcError, RpcReply,
};
use vigil_core::compliance::ComplianceClient;
use vigil_core::config::{ComplianceConfig, CompressionConfig};
use vigil_core::egress::wire::CompResultsMsg;
use vigil_core::egress::{EgressHandler, MessageType, Sink};
use vigil_core::policy::ports::InfrastructureState;

/// Stream stub: records start/stop calls, replays scripted task events,
/// then stays open until stopped.
struct StubRpc {
    starts: Mutex<Vec<ComplianceStart>>,
    stops: Mutex<u64>,
    runs: Mutex<Vec<ComplianceRun>>,
    script: Mutex<Vec<CompTaskEvent>>,
    stop_notify: Arc<Notify>,
    hang_on_stop: bool,
}

impl StubRpc {
    fn new(hang_on_stop: bool) -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
            runs: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
            stop_notify: Arc::new(Notify::new()),
            hang_on_stop,
        })
    }

    fn push_event(&self, event: CompTaskEvent) {
        self.script.lock().unwrap().push(event);
    }

    fn start_calendars(&self) -> Vec<BTreeSet<u64>> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.calendar.tasks.iter().map(|t| t.id).collect())
            .collect()
    }

    fn stop_count(&self) -> u64 {
        *self.stops.lock().unwrap()
    }
}

impl ComplianceRpc for StubRpc {
    fn start(
        &self,
        start: ComplianceStart,
        events: mpsc::Sender<CompTaskEvent>,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        self.starts.lock().unwrap().push(start);
        let script: Vec<CompTaskEvent> = self.script.lock().unwrap().drain(..).collect();
        let notify = Arc::clone(&self.stop_notify);
        async move {
            for event in script {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            // Stream stays open until the stop RPC.
            notify.notified().await;
            Ok(())
        }
        .boxed()
    }

    fn stop(&self) -> BoxFuture<'static, RpcReply> {
        *self.stops.lock().unwrap() += 1;
        let notify = Arc::clone(&self.stop_notify);
        let hang = self.hang_on_stop;
        async move {
            if hang {
                futures::future::pending::<()>().await;
            }
            notify.notify_waiters();
            RpcReply {
                successful: true,
                errstr: None,
            }
        }
        .boxed()
    }

    fn run_tasks(&self, run: ComplianceRun) -> BoxFuture<'static, RpcReply> {
        self.runs.lock().unwrap().push(run);
        async {
            RpcReply {
                successful: true,
                errstr: None,
            }
        }
        .boxed()
    }

    fn get_future_runs(
        &self,
        _run: ComplianceRun,
    ) -> BoxFuture<'static, Result<Vec<FutureRun>, RpcError>> {
        async { Ok(Vec::new()) }.boxed()
    }
}

fn task(id: u64, name: &str) -> CompTask {
    CompTask {
        id,
        name: name.to_string(),
        enabled: true,
        schedule: "06:00".to_string(),
        scope_predicates: Vec::new(),
    }
}

fn calendar(ids: &[u64]) -> CompCalendar {
    CompCalendar {
        tasks: ids.iter().map(|id| task(*id, &format!("task-{id}"))).collect(),
    }
}

struct Fixture {
    _runtime: tokio::runtime::Runtime,
    rpc: Arc<StubRpc>,
    infra: Arc<StubInfra>,
    sink: Arc<CollectSink>,
    client: ComplianceClient,
}

fn fixture(cfg: &ComplianceConfig, hang_on_stop: bool) -> Fixture {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let rpc = StubRpc::new(hang_on_stop);
    let infra = StubInfra::new();
    let sink = CollectSink::new();
    let sink_port: Arc<dyn Sink> = sink.clone();
    let egress = Arc::new(EgressHandler::new(sink_port, CompressionConfig::None));

    let client = ComplianceClient::new(
        cfg,
        "machine-1",
        "customer-1",
        Arc::clone(&rpc) as Arc<dyn ComplianceRpc>,
        Some(Arc::clone(&infra) as Arc<dyn InfrastructureState>),
        egress,
        runtime.handle().clone(),
    );

    Fixture {
        _runtime: runtime,
        rpc,
        infra,
        sink,
        client,
    }
}

fn cfg() -> ComplianceConfig {
    ComplianceConfig {
        enabled: true,
        refresh_interval: Duration::from_secs(120),
        stop_budget: Duration::from_millis(200),
        send_results: true,
        send_events: false,
        save_errors: true,
    }
}

#[test]
fn set_calendar_twice_is_a_single_start() {
    let f = fixture(&cfg(), false);

    f.client.set_calendar(calendar(&[1, 2, 3]), true, false);
    f.client.tick(1);
    assert_eq!(f.client.current_task_ids(), BTreeSet::from([1, 2, 3]));

    // Same calendar again: the diff is empty, nothing restarts.
    f.client.set_calendar(calendar(&[1, 2, 3]), true, false);
    f.client.tick(2);

    assert_eq!(f.rpc.start_calendars().len(), 1);
    assert_eq!(f.rpc.stop_count(), 0);
}

#[test]
fn replaced_task_restarts_stream_with_new_set() {
    let f = fixture(&cfg(), false);

    f.client.set_calendar(calendar(&[1, 2, 3]), true, false);
    f.client.tick(1);

    // One task replaced: stop within budget, then a fresh start with
    // exactly the new set.
    f.client.set_calendar(calendar(&[1, 3, 4]), true, false);
    f.client.tick(2);

    assert_eq!(f.rpc.stop_count(), 1);
    let starts = f.rpc.start_calendars();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[1], BTreeSet::from([1, 3, 4]));
    assert_eq!(f.client.current_task_ids(), BTreeSet::from([1, 3, 4]));
}

#[test]
fn scope_filtered_tasks_never_start() {
    let f = fixture(&cfg(), false);
    f.infra.deny_scope("compliance_tasks:task-2");

    f.client.set_calendar(calendar(&[1, 2]), true, false);
    f.client.tick(1);

    assert_eq!(f.client.current_task_ids(), BTreeSet::from([1]));
    assert_eq!(f.rpc.start_calendars(), vec![BTreeSet::from([1])]);
    // Scopes were registered for re-evaluation either way.
    assert!(f
        .infra
        .registered()
        .contains(&"compliance_tasks:task-1".to_string()));
}

#[test]
fn results_are_drained_to_the_sink() {
    let f = fixture(&cfg(), false);
    f.rpc.push_event(CompTaskEvent {
        task_name: "task-1".to_string(),
        init_successful: true,
        errstr: None,
        results: vec![CompResult {
            task_name: "task-1".to_string(),
            task_id: 1,
            successful: true,
            summary: "42 checks passed".to_string(),
        }],
        events: Vec::new(),
    });

    f.client.set_calendar(calendar(&[1]), true, false);
    f.client.tick(1);

    // The worker needs a moment to push the scripted event through the
    // channel before a tick can drain it.
    assert!(common::wait_for(Duration::from_secs(2), || {
        f.client.tick(2);
        !f.sink.of_type(MessageType::CompResults).is_empty()
    }));

    let batches: Vec<CompResultsMsg> = f.sink.decode_all(MessageType::CompResults);
    assert_eq!(batches[0].results.len(), 1);
    assert_eq!(batches[0].results[0].task_name, "task-1");
    assert!(batches[0].results[0].successful);
}

#[test]
fn failed_task_init_is_counted_and_ledgered() {
    let f = fixture(&cfg(), false);
    f.rpc.push_event(CompTaskEvent {
        task_name: "task-1".to_string(),
        init_successful: false,
        errstr: Some("docker socket unavailable".to_string()),
        results: Vec::new(),
        events: Vec::new(),
    });

    f.client.set_calendar(calendar(&[1]), true, false);
    f.client.tick(1);

    assert!(common::wait_for(Duration::from_secs(2), || {
        f.client.tick(2);
        f.client.rpc_errors() >= 1
    }));
    let errors = f.client.task_errors();
    assert_eq!(
        errors.get("task-1"),
        Some(&vec!["docker socket unavailable".to_string()])
    );
}

#[test]
fn stop_timeout_is_survivable() {
    let f = fixture(&cfg(), true);

    f.client.set_calendar(calendar(&[1]), true, false);
    f.client.tick(1);

    // The stop RPC hangs; the budget expires, the client logs and
    // proceeds with the restart anyway.
    f.client.set_calendar(calendar(&[2]), true, false);
    f.client.tick(2);

    assert_eq!(f.rpc.stop_count(), 1);
    assert_eq!(f.client.current_task_ids(), BTreeSet::from([2]));
    assert_eq!(f.rpc.start_calendars().len(), 2);
}

#[test]
fn run_now_fires_on_next_tick() {
    let f = fixture(&cfg(), false);

    f.client.run_now(vec![7, 8]);
    f.client.tick(1);

    assert!(common::wait_for(Duration::from_secs(2), || {
        !f.rpc.runs.lock().unwrap().is_empty()
    }));
    assert_eq!(
        f.rpc.runs.lock().unwrap()[0],
        ComplianceRun {
            task_ids: vec![7, 8]
        }
    );

    // The completed run is reaped without firing again.
    f.client.tick(2);
    f.client.tick(3);
    assert_eq!(f.rpc.runs.lock().unwrap().len(), 1);
}

#[test]
fn close_stops_the_stream() {
    let f = fixture(&cfg(), false);
    f.client.set_calendar(calendar(&[1]), true, false);
    f.client.tick(1);

    f.client.close();
    assert_eq!(f.rpc.stop_count(), 1);
    assert!(f.client.current_task_ids().is_empty());
}
