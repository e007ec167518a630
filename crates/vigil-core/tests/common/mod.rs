//! Shared stubs and harness for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use prost::Message;
use tempfile::TempDir;

use vigil_core::config::{CompressionConfig, MemdumpConfig, SecurityConfig};
use vigil_core::egress::{EgressHandler, Frame, MessageType, Priority, Sink};
use vigil_core::event::{Event, EventType, EventTypeSet};
use vigil_core::policy::actions::ActionCompletionHandle;
use vigil_core::policy::ports::{
    ContainerCmd, ContainerControl, InfrastructureState, RuleEngine, RuleEngineError, RuleMatch,
    ScopePredicate,
};
use vigil_core::policy::store::PolicyStore;
use vigil_core::ring::MemoryDumper;
use vigil_core::SecurityEngine;

/// Builds an event at `ts_ns`.
pub fn event(ts_ns: u64, event_type: EventType, container: Option<&str>) -> Event {
    Event {
        ts_ns,
        event_type,
        thread_id: 100,
        process_id: 99,
        container_id: container.map(str::to_string),
        params: Bytes::from_static(b"params"),
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------

struct StubRuleset {
    mask: EventTypeSet,
    rule: Option<RuleMatch>,
    calls: u64,
}

/// Rule engine stub: each ruleset gets a fixed mask and verdict.
pub struct StubRuleEngine {
    names: Mutex<Vec<String>>,
    rulesets: Mutex<HashMap<String, StubRuleset>>,
}

impl StubRuleEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            names: Mutex::new(Vec::new()),
            rulesets: Mutex::new(HashMap::new()),
        })
    }

    /// Configures `ruleset` to cover `types` and answer `rule` on every
    /// process call.
    pub fn on(&self, ruleset: &str, types: &[EventType], rule: Option<RuleMatch>) {
        self.rulesets.lock().unwrap().insert(
            ruleset.to_string(),
            StubRuleset {
                mask: types.iter().copied().collect(),
                rule,
                calls: 0,
            },
        );
    }

    /// Process calls observed for `ruleset`.
    pub fn calls(&self, ruleset: &str) -> u64 {
        self.rulesets
            .lock()
            .unwrap()
            .get(ruleset)
            .map_or(0, |r| r.calls)
    }

    fn name_of(&self, ruleset_id: u32) -> Option<String> {
        self.names.lock().unwrap().get(ruleset_id as usize).cloned()
    }
}

impl RuleEngine for StubRuleEngine {
    fn enable_rule(&self, _pattern: &str, _enabled: bool, _ruleset: &str) {}
    fn enable_by_tag(&self, _tags: &BTreeSet<String>, _enabled: bool, _ruleset: &str) {}

    fn find_ruleset_id(&self, ruleset: &str) -> u32 {
        let mut names = self.names.lock().unwrap();
        if let Some(pos) = names.iter().position(|n| n == ruleset) {
            return u32::try_from(pos).unwrap();
        }
        names.push(ruleset.to_string());
        u32::try_from(names.len() - 1).unwrap()
    }

    fn event_types_for(&self, ruleset_id: u32) -> EventTypeSet {
        self.name_of(ruleset_id)
            .and_then(|name| {
                self.rulesets
                    .lock()
                    .unwrap()
                    .get(&name)
                    .map(|r| r.mask)
            })
            .unwrap_or_default()
    }

    fn process(
        &self,
        event: &Event,
        ruleset_id: u32,
    ) -> Result<Option<RuleMatch>, RuleEngineError> {
        let Some(name) = self.name_of(ruleset_id) else {
            return Err(RuleEngineError(format!("unknown ruleset {ruleset_id}")));
        };
        let mut rulesets = self.rulesets.lock().unwrap();
        let Some(ruleset) = rulesets.get_mut(&name) else {
            return Ok(None);
        };
        ruleset.calls += 1;
        if ruleset.mask.contains(event.event_type) {
            Ok(ruleset.rule.clone())
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------

/// Infrastructure stub: a global allow switch plus per-scope answers.
pub struct StubInfra {
    pub allow: AtomicBool,
    scope_answers: Mutex<HashMap<String, bool>>,
    registered: Mutex<Vec<String>>,
}

impl StubInfra {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allow: AtomicBool::new(true),
            scope_answers: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
        })
    }

    /// Forces the answer for one registered scope id.
    pub fn deny_scope(&self, reg_id: &str) {
        self.scope_answers
            .lock()
            .unwrap()
            .insert(reg_id.to_string(), false);
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }
}

impl InfrastructureState for StubInfra {
    fn match_scope(
        &self,
        _container_id: Option<&str>,
        _host_id: &str,
        _predicates: &[ScopePredicate],
    ) -> bool {
        self.allow.load(Ordering::Relaxed)
    }

    fn register_scope(
        &self,
        reg_id: &str,
        _host_scope: bool,
        _container_scope: bool,
        _predicates: &[ScopePredicate],
    ) {
        self.registered.lock().unwrap().push(reg_id.to_string());
    }

    fn check_registered_scope(&self, reg_id: &str) -> bool {
        *self
            .scope_answers
            .lock()
            .unwrap()
            .get(reg_id)
            .unwrap_or(&true)
    }
}

// ---------------------------------------------------------------------------

/// What the container-control stub does with commands.
#[derive(Debug, Clone)]
pub enum StubMode {
    /// Complete successfully right away.
    CompleteOk,
    /// Complete with the given error right away.
    CompleteErr(String),
    /// Park the completion handle for the test to fire.
    Defer,
}

pub struct StubContainerControl {
    mode: StubMode,
    pub calls: Mutex<Vec<(ContainerCmd, String)>>,
    pub parked: Mutex<Vec<ActionCompletionHandle>>,
}

impl StubContainerControl {
    pub fn new(mode: StubMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
        })
    }

    /// Completes every parked command with the given outcome.
    pub fn release_all(&self, successful: bool, errmsg: Option<&str>) {
        for handle in self.parked.lock().unwrap().drain(..) {
            handle.complete(successful, errmsg.map(str::to_string));
        }
    }
}

impl ContainerControl for StubContainerControl {
    fn cmd(&self, kind: ContainerCmd, container_id: &str, done: ActionCompletionHandle) {
        self.calls
            .lock()
            .unwrap()
            .push((kind, container_id.to_string()));
        match &self.mode {
            StubMode::CompleteOk => done.complete(true, None),
            StubMode::CompleteErr(err) => done.complete(false, Some(err.clone())),
            StubMode::Defer => self.parked.lock().unwrap().push(done),
        }
    }
}

// ---------------------------------------------------------------------------

/// Sink capturing every offered frame.
pub struct CollectSink {
    pub frames: Mutex<Vec<(Frame, Priority)>>,
    pub reject: AtomicBool,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
        })
    }

    /// Frames of one message type, in arrival order.
    pub fn of_type(&self, msg_type: MessageType) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _)| f.msg_type == msg_type)
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Decodes every body of one message type.
    pub fn decode_all<M: Message + Default>(&self, msg_type: MessageType) -> Vec<M> {
        self.of_type(msg_type)
            .into_iter()
            .map(|f| M::decode(f.body).expect("wire body decodes"))
            .collect()
    }
}

impl Sink for CollectSink {
    fn put(&self, frame: Frame, priority: Priority) -> bool {
        if self.reject.load(Ordering::Relaxed) {
            return false;
        }
        self.frames.lock().unwrap().push((frame, priority));
        true
    }
}

// ---------------------------------------------------------------------------

/// A fully wired engine over stub ports and a real ring in a tempdir.
pub struct Harness {
    pub dir: TempDir,
    pub sink: Arc<CollectSink>,
    pub egress: Arc<EgressHandler>,
    pub dumper: Arc<MemoryDumper>,
    pub rules: Arc<StubRuleEngine>,
    pub infra: Arc<StubInfra>,
    pub containers: Arc<StubContainerControl>,
    pub store: Arc<PolicyStore>,
    pub engine: Arc<SecurityEngine>,
}

impl Harness {
    pub fn new(security: &SecurityConfig, memdump: &MemdumpConfig, mode: StubMode) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = CollectSink::new();
        let sink_port: Arc<dyn Sink> = sink.clone();
        let egress = Arc::new(EgressHandler::new(sink_port, CompressionConfig::None));
        let dumper =
            MemoryDumper::open(memdump, dir.path(), Arc::clone(&egress)).expect("dumper opens");

        let rules = StubRuleEngine::new();
        let infra = StubInfra::new();
        let containers = StubContainerControl::new(mode);
        let store = Arc::new(PolicyStore::new(Arc::clone(&rules) as Arc<dyn RuleEngine>));

        let engine = SecurityEngine::new(
            security,
            "host-test",
            Arc::clone(&store),
            Arc::clone(&rules) as Arc<dyn RuleEngine>,
            Arc::clone(&infra) as Arc<dyn InfrastructureState>,
            Arc::clone(&containers) as Arc<dyn ContainerControl>,
            None,
            Arc::clone(&dumper),
            Arc::clone(&egress),
        );

        Self {
            dir,
            sink,
            egress,
            dumper,
            rules,
            infra,
            containers,
            store,
            engine,
        }
    }

    /// Feeds one event through the producer path (ring, then engine).
    pub fn feed(&self, event: &Event) -> bool {
        self.dumper.append(event);
        self.engine.process_event(event)
    }
}
