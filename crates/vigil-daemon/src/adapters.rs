//! Built-in implementations of the core's external ports.
//!
//! The production deployment injects the full rule compiler, the
//! infrastructure inventory, and the container-runtime RPC client from
//! their own services. The shipped binary carries these self-contained
//! stand-ins so a single host install still evaluates policies
//! end-to-end: a predicate-based rule engine over a YAML rules file, a
//! label-map inventory, and a container control that shells out to the
//! runtime CLI.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use vigil_core::event::filter::{
    AndPredicate, EventPredicate, FilterCompiler, FilterError,
};
use vigil_core::event::{Event, EventType, EventTypeSet};
use vigil_core::policy::actions::ActionCompletionHandle;
use vigil_core::policy::ports::{
    ContainerCmd, ContainerControl, InfrastructureState, RuleEngine, RuleEngineError, RuleMatch,
    ScopeOp, ScopePredicate,
};

/// One rule in the built-in rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    /// Rule name.
    pub name: String,

    /// Tags for tag-based policy selection.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Event types the rule can match.
    pub event_types: Vec<EventType>,

    /// Optional condition expression (see [`SimpleFilterCompiler`]).
    #[serde(default)]
    pub condition: Option<String>,

    /// Output template for matches.
    pub output: String,
}

/// Top-level shape of the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    /// Rules, in declaration order.
    pub rules: Vec<RuleDef>,
}

/// Errors loading the built-in rules file.
#[derive(Debug, Error)]
pub enum RuleLoadError {
    /// Could not read the file.
    #[error("could not read rules file {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file did not parse.
    #[error("could not parse rules file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A rule condition did not compile.
    #[error("rule {rule}: {source}")]
    Condition {
        /// Offending rule.
        rule: String,
        /// Compiler diagnostic.
        #[source]
        source: FilterError,
    },
}

struct CompiledRule {
    def: RuleDef,
    mask: EventTypeSet,
    condition: Option<Arc<dyn EventPredicate>>,
}

#[derive(Default)]
struct RulesetTable {
    names: Vec<String>,
    /// Per ruleset: one enable flag per rule index.
    enabled: Vec<Vec<bool>>,
}

impl RulesetTable {
    fn id(&mut self, ruleset: &str, rule_count: usize) -> usize {
        if let Some(pos) = self.names.iter().position(|n| n == ruleset) {
            return pos;
        }
        self.names.push(ruleset.to_string());
        self.enabled.push(vec![false; rule_count]);
        self.names.len() - 1
    }
}

/// Predicate-based rule engine over a static rules file.
pub struct SimpleRuleEngine {
    rules: Vec<CompiledRule>,
    rulesets: Mutex<RulesetTable>,
}

impl SimpleRuleEngine {
    /// Loads rules from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`RuleLoadError`] if the file cannot be read, parsed,
    /// or a condition does not compile.
    pub fn load(path: &Path) -> Result<Arc<Self>, RuleLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: RuleFile = serde_yaml::from_str(&text)?;
        Self::from_rules(file.rules)
    }

    /// Compiles an in-memory rule list.
    ///
    /// # Errors
    ///
    /// Returns [`RuleLoadError::Condition`] for an uncompilable
    /// condition.
    pub fn from_rules(defs: Vec<RuleDef>) -> Result<Arc<Self>, RuleLoadError> {
        let compiler = SimpleFilterCompiler;
        let mut rules = Vec::with_capacity(defs.len());
        for def in defs {
            let condition = match &def.condition {
                Some(expr) => Some(compiler.compile(expr).map_err(|source| {
                    RuleLoadError::Condition {
                        rule: def.name.clone(),
                        source,
                    }
                })?),
                None => None,
            };
            rules.push(CompiledRule {
                mask: def.event_types.iter().copied().collect(),
                condition,
                def,
            });
        }
        debug!(rules = rules.len(), "loaded rules");
        Ok(Arc::new(Self {
            rules,
            rulesets: Mutex::new(RulesetTable::default()),
        }))
    }
}

impl RuleEngine for SimpleRuleEngine {
    fn enable_rule(&self, pattern: &str, enabled: bool, ruleset: &str) {
        let mut table = self.rulesets.lock().expect("rulesets poisoned");
        let id = table.id(ruleset, self.rules.len());

        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => {
                for (idx, rule) in self.rules.iter().enumerate() {
                    if re.is_match(&rule.def.name) {
                        table.enabled[id][idx] = enabled;
                    }
                }
            },
            Err(err) => {
                warn!(pattern, %err, "bad rule pattern, falling back to exact match");
                for (idx, rule) in self.rules.iter().enumerate() {
                    if rule.def.name == pattern {
                        table.enabled[id][idx] = enabled;
                    }
                }
            },
        }
    }

    fn enable_by_tag(&self, tags: &BTreeSet<String>, enabled: bool, ruleset: &str) {
        let mut table = self.rulesets.lock().expect("rulesets poisoned");
        let id = table.id(ruleset, self.rules.len());
        for (idx, rule) in self.rules.iter().enumerate() {
            if !rule.def.tags.is_disjoint(tags) {
                table.enabled[id][idx] = enabled;
            }
        }
    }

    fn find_ruleset_id(&self, ruleset: &str) -> u32 {
        let mut table = self.rulesets.lock().expect("rulesets poisoned");
        u32::try_from(table.id(ruleset, self.rules.len())).unwrap_or(u32::MAX)
    }

    fn event_types_for(&self, ruleset_id: u32) -> EventTypeSet {
        let table = self.rulesets.lock().expect("rulesets poisoned");
        let Some(enabled) = table.enabled.get(ruleset_id as usize) else {
            return EventTypeSet::empty();
        };
        let mut mask = EventTypeSet::empty();
        for (idx, rule) in self.rules.iter().enumerate() {
            if enabled[idx] {
                mask = mask.union(rule.mask);
            }
        }
        mask
    }

    fn process(
        &self,
        event: &Event,
        ruleset_id: u32,
    ) -> Result<Option<RuleMatch>, RuleEngineError> {
        let table = self.rulesets.lock().expect("rulesets poisoned");
        let Some(enabled) = table.enabled.get(ruleset_id as usize) else {
            return Err(RuleEngineError(format!("unknown ruleset id {ruleset_id}")));
        };

        for (idx, rule) in self.rules.iter().enumerate() {
            if !enabled[idx] || !rule.mask.contains(event.event_type) {
                continue;
            }
            if rule
                .condition
                .as_ref()
                .is_none_or(|condition| condition.matches(event))
            {
                return Ok(Some(RuleMatch {
                    rule_name: rule.def.name.clone(),
                    format_template: rule.def.output.clone(),
                }));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------

/// Compiles `field op value [and field op value ...]` conjunctions.
///
/// Fields: `evt.type`, `container.id`, `proc.pid`, `thread.tid`.
/// Operators: `=`, `!=`. Values may be double-quoted.
pub struct SimpleFilterCompiler;

#[derive(Debug, Clone, Copy)]
enum Field {
    EvtType,
    ContainerId,
    ProcPid,
    ThreadTid,
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    NotEq,
}

struct FieldPredicate {
    field: Field,
    op: CmpOp,
    value: String,
}

impl EventPredicate for FieldPredicate {
    fn matches(&self, event: &Event) -> bool {
        let actual: String = match self.field {
            Field::EvtType => event.event_type.name().to_string(),
            Field::ContainerId => event.container().unwrap_or("").to_string(),
            Field::ProcPid => event.process_id.to_string(),
            Field::ThreadTid => event.thread_id.to_string(),
        };
        match self.op {
            CmpOp::Eq => actual == self.value,
            CmpOp::NotEq => actual != self.value,
        }
    }
}

impl SimpleFilterCompiler {
    fn compile_clause(expr: &str, clause: &str) -> Result<Arc<dyn EventPredicate>, FilterError> {
        let err = |detail: &str| FilterError {
            expr: expr.to_string(),
            detail: detail.to_string(),
        };

        let (lhs, op, rhs) = if let Some((l, r)) = clause.split_once("!=") {
            (l, CmpOp::NotEq, r)
        } else if let Some((l, r)) = clause.split_once('=') {
            (l, CmpOp::Eq, r)
        } else {
            return Err(err("expected `field=value` or `field!=value`"));
        };

        let field = match lhs.trim() {
            "evt.type" => Field::EvtType,
            "container.id" => Field::ContainerId,
            "proc.pid" => Field::ProcPid,
            "thread.tid" => Field::ThreadTid,
            other => return Err(err(&format!("unknown field `{other}`"))),
        };
        let value = rhs.trim().trim_matches('"').to_string();

        Ok(Arc::new(FieldPredicate { field, op, value }))
    }
}

impl FilterCompiler for SimpleFilterCompiler {
    fn compile(&self, expr: &str) -> Result<Arc<dyn EventPredicate>, FilterError> {
        let mut predicate: Option<Arc<dyn EventPredicate>> = None;
        for clause in expr.split(" and ") {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let compiled = Self::compile_clause(expr, clause)?;
            predicate = Some(match predicate {
                Some(prev) => Arc::new(AndPredicate::new(prev, compiled)),
                None => compiled,
            });
        }
        predicate.ok_or_else(|| FilterError {
            expr: expr.to_string(),
            detail: "empty filter expression".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------

struct RegisteredScope {
    host_scope: bool,
    container_scope: bool,
    predicates: Vec<ScopePredicate>,
}

/// Label-map infrastructure inventory.
///
/// `host.*` keys resolve against the host label map (with
/// `host.hostName` implied from the host id); `container.*` keys
/// against the labels registered per container.
pub struct LabelInfraState {
    host_labels: HashMap<String, String>,
    containers: Mutex<HashMap<String, HashMap<String, String>>>,
    scopes: Mutex<HashMap<String, RegisteredScope>>,
}

impl LabelInfraState {
    /// Creates an inventory with the given host labels.
    #[must_use]
    pub fn new(host_labels: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            host_labels,
            containers: Mutex::new(HashMap::new()),
            scopes: Mutex::new(HashMap::new()),
        })
    }

    /// Registers (or replaces) a container's label map.
    pub fn set_container_labels(&self, container_id: &str, labels: HashMap<String, String>) {
        self.containers
            .lock()
            .expect("containers poisoned")
            .insert(container_id.to_string(), labels);
    }

    fn lookup(&self, container_id: Option<&str>, host_id: &str, key: &str) -> Option<String> {
        if let Some(rest) = key.strip_prefix("container.") {
            let containers = self.containers.lock().expect("containers poisoned");
            let labels = containers.get(container_id?)?;
            return labels.get(rest).or_else(|| labels.get(key)).cloned();
        }
        if key == "host.hostName" {
            return Some(
                self.host_labels
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| host_id.to_string()),
            );
        }
        self.host_labels.get(key).cloned()
    }

    fn eval(&self, container_id: Option<&str>, host_id: &str, predicate: &ScopePredicate) -> bool {
        let actual = self.lookup(container_id, host_id, &predicate.key);
        let first = predicate.values.first().map(String::as_str).unwrap_or("");
        match (&predicate.op, actual) {
            (ScopeOp::Eq, Some(v)) => v == first,
            (ScopeOp::NotEq, Some(v)) => v != first,
            (ScopeOp::In, Some(v)) => predicate.values.iter().any(|x| *x == v),
            (ScopeOp::NotIn, Some(v)) => !predicate.values.iter().any(|x| *x == v),
            (ScopeOp::Contains, Some(v)) => v.contains(first),
            (ScopeOp::StartsWith, Some(v)) => v.starts_with(first),
            // Missing attributes satisfy only the negated operators.
            (ScopeOp::NotEq | ScopeOp::NotIn, None) => true,
            (_, None) => false,
        }
    }
}

impl InfrastructureState for LabelInfraState {
    fn match_scope(
        &self,
        container_id: Option<&str>,
        host_id: &str,
        predicates: &[ScopePredicate],
    ) -> bool {
        predicates
            .iter()
            .all(|p| self.eval(container_id, host_id, p))
    }

    fn register_scope(
        &self,
        reg_id: &str,
        host_scope: bool,
        container_scope: bool,
        predicates: &[ScopePredicate],
    ) {
        self.scopes.lock().expect("scopes poisoned").insert(
            reg_id.to_string(),
            RegisteredScope {
                host_scope,
                container_scope,
                predicates: predicates.to_vec(),
            },
        );
    }

    fn check_registered_scope(&self, reg_id: &str) -> bool {
        let scopes = self.scopes.lock().expect("scopes poisoned");
        let Some(scope) = scopes.get(reg_id) else {
            return false;
        };

        let host_id = self
            .host_labels
            .get("host.hostName")
            .cloned()
            .unwrap_or_default();
        if scope.host_scope && self.match_scope(None, &host_id, &scope.predicates) {
            return true;
        }
        if scope.container_scope {
            let ids: Vec<String> = {
                let containers = self.containers.lock().expect("containers poisoned");
                containers.keys().cloned().collect()
            };
            return ids
                .iter()
                .any(|id| self.match_scope(Some(id), &host_id, &scope.predicates));
        }
        false
    }
}

// ---------------------------------------------------------------------------

/// Container control that shells out to the runtime CLI
/// (`docker pause <id>` and friends) on a short-lived thread.
pub struct ExecContainerControl {
    runtime_bin: String,
}

impl ExecContainerControl {
    /// Creates a control using `runtime_bin` (`docker`, `podman`, ...).
    #[must_use]
    pub fn new(runtime_bin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            runtime_bin: runtime_bin.into(),
        })
    }
}

impl ContainerControl for ExecContainerControl {
    fn cmd(&self, kind: ContainerCmd, container_id: &str, done: ActionCompletionHandle) {
        let bin = self.runtime_bin.clone();
        let container_id = container_id.to_string();
        std::thread::spawn(move || {
            let output = std::process::Command::new(&bin)
                .arg(kind.to_string())
                .arg(&container_id)
                .output();
            match output {
                Ok(out) if out.status.success() => done.complete(true, None),
                Ok(out) => done.complete(
                    false,
                    Some(format!(
                        "{bin} {kind} {container_id} failed ({}): {}",
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    )),
                ),
                Err(err) => done.complete(
                    false,
                    Some(format!("could not run {bin} {kind} {container_id}: {err}")),
                ),
            }
        });
    }
}
