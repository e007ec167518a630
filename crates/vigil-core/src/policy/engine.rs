//! The security policy engine.
//!
//! For each incoming event the engine selects candidate policies by
//! event type, checks the enable flag and scope, delegates condition
//! evaluation to the rule engine, and on a hit builds a
//! [`PolicyEvent`](super::PolicyEvent) and schedules the policy's
//! actions. A match short-circuits: later policies never see the event,
//! which deliberately makes configuration order significant.
//!
//! # Deferred emission
//!
//! Emission is two-phase. Action results are pre-allocated in
//! configuration order; asynchronous completions stamp their slot
//! through the handle table ([`super::actions`]). Once a state's
//! outstanding counter reaches zero the event is offered to the throttle
//! ledger, and any successful capture is *then* either drained to the
//! sink (accepted) or stopped without emitting a byte (suppressed), so
//! capture data leaves the host if and only if its triggering event
//! does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::actions::{ActionCompletion, ActionCompletionHandle, ActionHandle};
use super::format;
use super::metrics::{EngineMetrics, EvalCounter};
use super::policy::{ActionDescriptor, CompiledPolicy};
use super::ports::{ContainerCmd, ContainerControl, InfrastructureState, RuleEngine};
use super::store::PolicyStore;
use super::throttle::ThrottleLedger;
use super::{ActionResult, ActionType, PolicyEvent};
use crate::clock;
use crate::config::SecurityConfig;
use crate::egress::wire::{PolicyEventsMsg, ThrottledEntryMsg, ThrottledPolicyEventsMsg};
use crate::egress::EgressHandler;
use crate::event::filter::{AndPredicate, ContainerPredicate, EventPredicate, FilterCompiler};
use crate::event::Event;
use crate::ring::{CaptureSpec, MemoryDumper};

/// Per-matched-event bookkeeping until every action settles.
struct ActionState {
    event: PolicyEvent,
    outstanding: usize,
    send_immediately: bool,
    capture_token: Option<Uuid>,
}

/// The policy evaluation engine. Shared between the producer thread
/// (`process_event`) and the control thread (`check_outstanding_actions`,
/// `flush`).
pub struct SecurityEngine {
    store: Arc<PolicyStore>,
    rules: Arc<dyn RuleEngine>,
    infra: Arc<dyn InfrastructureState>,
    containers: Arc<dyn ContainerControl>,
    filters: Option<Arc<dyn FilterCompiler>>,
    dumper: Arc<MemoryDumper>,
    egress: Arc<EgressHandler>,
    throttle: ThrottleLedger,
    host_id: String,

    outstanding: Mutex<HashMap<ActionHandle, ActionState>>,
    next_handle: AtomicU64,
    completions_tx: mpsc::Sender<ActionCompletion>,
    completions_rx: Mutex<mpsc::Receiver<ActionCompletion>>,
    pending: Mutex<Vec<PolicyEvent>>,

    /// Engine-wide evaluation counters.
    pub metrics: EngineMetrics,
    dropped_events: AtomicU64,
    scopeless_warned: AtomicBool,
}

impl SecurityEngine {
    /// Builds an engine over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &SecurityConfig,
        host_id: impl Into<String>,
        store: Arc<PolicyStore>,
        rules: Arc<dyn RuleEngine>,
        infra: Arc<dyn InfrastructureState>,
        containers: Arc<dyn ContainerControl>,
        filters: Option<Arc<dyn FilterCompiler>>,
        dumper: Arc<MemoryDumper>,
        egress: Arc<EgressHandler>,
    ) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::channel();
        Arc::new(Self {
            store,
            rules,
            infra,
            containers,
            filters,
            dumper,
            egress,
            throttle: ThrottleLedger::new(cfg.throttle_rate, cfg.throttle_max_burst),
            host_id: host_id.into(),
            outstanding: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            pending: Mutex::new(Vec::new()),
            metrics: EngineMetrics::default(),
            dropped_events: AtomicU64::new(0),
            scopeless_warned: AtomicBool::new(false),
        })
    }

    /// Records one event the source had to drop (malformed frame,
    /// backpressure). Snapshotted into every emitted `PolicyEvent`.
    pub fn note_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Action states not yet settled. Diagnostics and tests.
    #[must_use]
    pub fn outstanding_actions(&self) -> usize {
        self.outstanding.lock().expect("engine poisoned").len()
    }

    /// Runs `event` through the candidate policies. Returns `true` when
    /// a policy matched (and short-circuited the rest).
    pub fn process_event(&self, event: &Event) -> bool {
        // Settle whatever completed since the last event first, so
        // capture verdicts are never gated on traffic alone.
        self.check_outstanding_actions();

        let tables = self.store.tables();
        for policy in tables.candidates(event.event_type) {
            if !policy.enabled {
                self.metrics.incr(policy.id, EvalCounter::PolicyDisabled);
                continue;
            }
            if !self.match_scope(event, policy) {
                self.metrics.incr(policy.id, EvalCounter::ScopeMiss);
                continue;
            }

            let hit = match self.rules.process(event, policy.ruleset_id) {
                Ok(hit) => hit,
                Err(err) => {
                    warn!(policy = %policy.name, %err, "rule engine failed, treating as miss");
                    self.metrics.incr(policy.id, EvalCounter::EngineError);
                    continue;
                },
            };
            let Some(rule_match) = hit else {
                self.metrics.incr(policy.id, EvalCounter::RuleMiss);
                continue;
            };

            debug!(policy = %policy.name, rule = %rule_match.rule_name, "event matched policy");
            self.metrics.incr(policy.id, EvalCounter::Matched);

            let policy_event = PolicyEvent {
                ts_ns: event.ts_ns,
                policy_id: policy.id,
                container_id: event.container_id.clone(),
                rule: rule_match.rule_name,
                output: format::render(&rule_match.format_template, event),
                action_results: Vec::with_capacity(policy.actions.len()),
                events_dropped: self.dropped_events.load(Ordering::Relaxed),
            };
            self.perform_actions(event, policy, policy_event);
            return true;
        }
        false
    }

    /// Scope check. A policy with predicates consults the
    /// infrastructure state; a policy with neither host nor container
    /// scope should not exist, so it logs once and is allowed to run.
    fn match_scope(&self, event: &Event, policy: &CompiledPolicy) -> bool {
        if policy.scope_predicates.is_empty() {
            return true;
        }
        if !policy.host_scope && !policy.container_scope {
            if !self.scopeless_warned.swap(true, Ordering::AcqRel) {
                warn!(
                    policy = %policy.name,
                    "policy has neither host nor container scope; allowing anyway"
                );
            }
            return true;
        }
        self.infra
            .match_scope(event.container(), &self.host_id, &policy.scope_predicates)
    }

    fn perform_actions(&self, event: &Event, policy: &CompiledPolicy, policy_event: PolicyEvent) {
        let handle = ActionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut state = ActionState {
            event: policy_event,
            outstanding: policy.actions.len(),
            send_immediately: false,
            capture_token: None,
        };

        for (slot, action) in policy.actions.iter().enumerate() {
            match action {
                ActionDescriptor::Capture {
                    before,
                    after,
                    filter,
                    limit_to_container,
                } => {
                    let result = self.dispatch_capture(
                        event,
                        policy,
                        before.as_nanos() as u64,
                        after.as_nanos() as u64,
                        filter.as_deref(),
                        *limit_to_container,
                    );
                    match result {
                        Ok(token) => {
                            // A successful capture forces immediate
                            // emission once the event settles.
                            state.send_immediately = true;
                            state.capture_token = Some(token);
                            state.event.action_results.push(ActionResult {
                                token: Some(token),
                                ..ActionResult::pending(ActionType::Capture)
                            });
                        },
                        Err(errmsg) => {
                            debug!(policy = %policy.name, %errmsg, "capture action failed");
                            state
                                .event
                                .action_results
                                .push(ActionResult::failed(ActionType::Capture, errmsg));
                        },
                    }
                    state.outstanding -= 1;
                },

                ActionDescriptor::Pause | ActionDescriptor::Stop => {
                    let kind = if matches!(action, ActionDescriptor::Pause) {
                        ContainerCmd::Pause
                    } else {
                        ContainerCmd::Stop
                    };
                    state
                        .event
                        .action_results
                        .push(ActionResult::pending(action.action_type()));
                    match event.container() {
                        Some(container_id) => {
                            self.containers.cmd(
                                kind,
                                container_id,
                                ActionCompletionHandle::new(
                                    self.completions_tx.clone(),
                                    handle,
                                    slot,
                                ),
                            );
                        },
                        None => {
                            let slot_ref = state
                                .event
                                .action_results
                                .last_mut()
                                .expect("slot just pushed");
                            slot_ref.successful = false;
                            slot_ref.errmsg =
                                Some(format!("cannot {kind}: event has no container"));
                            state.outstanding -= 1;
                        },
                    }
                },

                ActionDescriptor::Unknown => {
                    let errmsg = "policy action not implemented".to_string();
                    debug!(policy = %policy.name, %errmsg, "skipping unknown action");
                    state
                        .event
                        .action_results
                        .push(ActionResult::failed(ActionType::Unknown, errmsg));
                    state.outstanding -= 1;
                },
            }
        }

        self.outstanding
            .lock()
            .expect("engine poisoned")
            .insert(handle, state);
    }

    fn dispatch_capture(
        &self,
        event: &Event,
        policy: &CompiledPolicy,
        before_ns: u64,
        after_ns: u64,
        filter: Option<&str>,
        limit_to_container: bool,
    ) -> Result<Uuid, String> {
        let mut predicate: Option<Arc<dyn EventPredicate>> = None;

        if let Some(expr) = filter {
            let compiler = self
                .filters
                .as_ref()
                .ok_or_else(|| "no capture filter compiler available".to_string())?;
            predicate = Some(compiler.compile(expr).map_err(|err| err.to_string())?);
        }
        if limit_to_container {
            if let Some(container_id) = event.container() {
                let scoped: Arc<dyn EventPredicate> =
                    Arc::new(ContainerPredicate::new(container_id));
                predicate = Some(match predicate {
                    Some(filter) => Arc::new(AndPredicate::new(filter, scoped)),
                    None => scoped,
                });
            }
        }

        let spec = CaptureSpec {
            label: policy.name.clone(),
            start_ts_ns: if before_ns == 0 {
                0
            } else {
                event.ts_ns.saturating_sub(before_ns)
            },
            end_ts_ns: event.ts_ns + after_ns,
            future_ns: after_ns,
            filter: predicate,
        };
        self.dumper
            .start_capture(spec)
            .map_err(|err| err.to_string())
    }

    /// Stamps completed asynchronous actions and emits every settled
    /// event. Called from the control tick and at the start of each
    /// event evaluation.
    pub fn check_outstanding_actions(&self) {
        // Drain completions into their slots first.
        {
            let rx = self.completions_rx.lock().expect("engine poisoned");
            let mut table = self.outstanding.lock().expect("engine poisoned");
            while let Ok(done) = rx.try_recv() {
                let Some(state) = table.get_mut(&done.handle) else {
                    trace!(handle = %done.handle, "stale action completion ignored");
                    continue;
                };
                if let Some(slot) = state.event.action_results.get_mut(done.slot) {
                    if !done.successful {
                        slot.successful = false;
                        slot.errmsg = done.errmsg;
                    }
                    debug!(
                        handle = %done.handle,
                        slot = done.slot,
                        successful = done.successful,
                        "container command completed"
                    );
                }
                state.outstanding = state.outstanding.saturating_sub(1);
            }
        }

        // Settle everything whose counter reached zero.
        let settled: Vec<ActionState> = {
            let mut table = self.outstanding.lock().expect("engine poisoned");
            let handles: Vec<ActionHandle> = table
                .iter()
                .filter(|(_, state)| state.outstanding == 0)
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| table.remove(&handle))
                .collect()
        };

        for state in settled {
            let accepted = self.accept_policy_event(state.event, state.send_immediately);
            if let Some(token) = state.capture_token {
                let verdict = if accepted {
                    self.dumper.start_sending(token)
                } else {
                    self.dumper.stop_capture(token)
                };
                if let Err(err) = verdict {
                    warn!(%token, %err, "could not apply capture verdict");
                }
            }
        }
    }

    /// Offers an event to the throttle ledger; accepted events are
    /// forwarded (immediately when `send_now`), suppressed ones only
    /// counted.
    fn accept_policy_event(&self, event: PolicyEvent, send_now: bool) -> bool {
        let accepted = self.throttle.accept(event.policy_id, event.ts_ns);
        if accepted {
            if send_now {
                self.egress.policy_events_ready(
                    clock::wall_ns(),
                    &PolicyEventsMsg {
                        events: vec![(&event).into()],
                    },
                );
            } else {
                self.pending.lock().expect("engine poisoned").push(event);
            }
        }
        accepted
    }

    /// Flushes the pending batch, the throttle summary, and the
    /// per-policy counters. Called at each report interval.
    pub fn flush(&self, ts_ns: u64) {
        let batch: Vec<PolicyEvent> =
            std::mem::take(&mut *self.pending.lock().expect("engine poisoned"));
        if !batch.is_empty() {
            self.egress.policy_events_ready(
                ts_ns,
                &PolicyEventsMsg {
                    events: batch.iter().map(Into::into).collect(),
                },
            );
        }

        let (entries, total) = self.throttle.flush();
        if total > 0 {
            self.egress.throttled_events_ready(
                ts_ns,
                &ThrottledPolicyEventsMsg {
                    timestamp_ns: ts_ns,
                    entries: entries
                        .into_iter()
                        .map(|e| ThrottledEntryMsg {
                            policy_id: e.policy_id,
                            count: e.count,
                        })
                        .collect(),
                    total_count: total,
                },
            );
        }

        self.metrics.report();
    }
}

impl std::fmt::Debug for SecurityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEngine")
            .field("host_id", &self.host_id)
            .field("outstanding", &self.outstanding_actions())
            .finish_non_exhaustive()
    }
}
