use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tm_core::model::TaskRecord;

use crate::client::{ClientId, ClientState};

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Failures accumulate.
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

/// One broken invariant, with enough detail to start debugging a replay.
#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// The server has a task the client never received.
    MissingTask { client: ClientId, task: String },
    /// The client holds a task the server never stored.
    UnexpectedTask { client: ClientId, task: String },
    /// Client and server disagree on some fields of a task.
    Divergent {
        client: ClientId,
        task: String,
        fields: Vec<String>,
    },
    /// The client still has changes the server never acknowledged.
    Unsent { client: ClientId, count: usize },
    /// Following parent links from `task` returns to it.
    Cycle { client: ClientId, task: String },
    /// Two siblings share a sort order, or a sibling has none.
    SiblingOrder {
        client: ClientId,
        parent: String,
        orders: Vec<Option<f64>>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTask { client, task } => {
                write!(f, "MissingTask: client {client} never received {task}")
            }
            Self::UnexpectedTask { client, task } => {
                write!(f, "UnexpectedTask: client {client} has {task}, server does not")
            }
            Self::Divergent {
                client,
                task,
                fields,
            } => write!(
                f,
                "Divergent: client {client} disagrees with the server on {task} ({})",
                fields.join(", ")
            ),
            Self::Unsent { client, count } => {
                write!(f, "Unsent: client {client} still holds {count} unacknowledged change(s)")
            }
            Self::Cycle { client, task } => {
                write!(f, "Cycle: client {client} reaches {task} from itself via parents")
            }
            Self::SiblingOrder {
                client,
                parent,
                orders,
            } => write!(
                f,
                "SiblingOrder: client {client} has ambiguous subtask orders under {parent}: {orders:?}"
            ),
        }
    }
}

/// Summary for quick reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Every client matches the server.
    pub converged: bool,
    /// Clients that differ from the server in any task.
    pub divergent_clients: Vec<ClientId>,
    /// Tasks stored on the server.
    pub server_task_count: usize,
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks the end state of a simulation.
///
/// # Invariants checked
///
/// 1. **Convergence**: every client holds exactly the server's tasks, with
///    the same content. Versions are sync bookkeeping and are ignored.
/// 2. **Delivery**: no client is left with unacknowledged changes.
/// 3. **Acyclicity**: parent links never loop.
/// 4. **Sibling order**: subtasks of one parent have distinct sort orders.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    #[must_use]
    pub fn evaluate(states: &[ClientState], server: &BTreeMap<String, TaskRecord>) -> ConvergenceReport {
        let divergent_clients = states
            .iter()
            .filter(|s| &s.records != server)
            .map(|s| s.id)
            .collect::<Vec<_>>();
        ConvergenceReport {
            converged: divergent_clients.is_empty(),
            divergent_clients,
            server_task_count: server.len(),
        }
    }

    #[must_use]
    pub fn check_convergence(
        states: &[ClientState],
        server: &BTreeMap<String, TaskRecord>,
    ) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            for (task, expected) in server {
                match state.records.get(task) {
                    None => violations.push(InvariantViolation::MissingTask {
                        client: state.id,
                        task: task.clone(),
                    }),
                    Some(local) if local != expected => {
                        violations.push(InvariantViolation::Divergent {
                            client: state.id,
                            task: task.clone(),
                            fields: differing_fields(local, expected),
                        });
                    }
                    Some(_) => {}
                }
            }
            for task in state.records.keys().filter(|t| !server.contains_key(*t)) {
                violations.push(InvariantViolation::UnexpectedTask {
                    client: state.id,
                    task: task.clone(),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_delivery(states: &[ClientState]) -> OracleResult {
        OracleResult::from_violations(
            states
                .iter()
                .filter(|s| s.unsent > 0)
                .map(|s| InvariantViolation::Unsent {
                    client: s.id,
                    count: s.unsent,
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn check_acyclic(states: &[ClientState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            for task in state.records.keys() {
                let mut seen = BTreeSet::new();
                let mut cursor = state.records.get(task).and_then(|r| r.parent.as_ref());
                while let Some(parent) = cursor {
                    if parent.as_str() == task {
                        violations.push(InvariantViolation::Cycle {
                            client: state.id,
                            task: task.clone(),
                        });
                        break;
                    }
                    // A loop that does not pass through `task` is reported
                    // from one of its own members.
                    if !seen.insert(parent.as_str()) {
                        break;
                    }
                    cursor = state
                        .records
                        .get(parent.as_str())
                        .and_then(|r| r.parent.as_ref());
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_sibling_order(states: &[ClientState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let mut families: BTreeMap<&str, Vec<Option<f64>>> = BTreeMap::new();
            for record in state.records.values() {
                if let Some(parent) = &record.parent {
                    families
                        .entry(parent.as_str())
                        .or_default()
                        .push(record.sort_order);
                }
            }
            for (parent, mut orders) in families {
                orders.sort_by(|a, b| tm_core::order::compare_real(*a, *b));
                let ambiguous = orders.iter().any(Option::is_none)
                    || orders.windows(2).any(|w| w[0] == w[1]);
                if ambiguous {
                    violations.push(InvariantViolation::SiblingOrder {
                        client: state.id,
                        parent: parent.to_string(),
                        orders,
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Run every check.
    #[must_use]
    pub fn check_all(states: &[ClientState], server: &BTreeMap<String, TaskRecord>) -> OracleResult {
        OracleResult::pass()
            .merge(Self::check_convergence(states, server))
            .merge(Self::check_delivery(states))
            .merge(Self::check_acyclic(states))
            .merge(Self::check_sibling_order(states))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Names of the top-level fields whose JSON forms differ.
fn differing_fields(a: &TaskRecord, b: &TaskRecord) -> Vec<String> {
    let (Ok(serde_json::Value::Object(a)), Ok(serde_json::Value::Object(b))) =
        (serde_json::to_value(a), serde_json::to_value(b))
    else {
        return vec!["<unserializable>".to_string()];
    };
    a.iter()
        .filter(|(key, value)| b.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tm_core::model::{ProjectType, Status, TaskId};

    fn record(id: &str, parent: Option<&str>, order: Option<f64>) -> TaskRecord {
        TaskRecord {
            id: TaskId::from(id),
            title: id.to_uppercase(),
            notes: String::new(),
            created: 1,
            deleted: false,
            parent: parent.map(TaskId::from),
            project_type: ProjectType::Plain,
            sort_order: order,
            starred: false,
            status: Status::Open,
            status_changed: None,
            reviewed: false,
            deferred: None,
            deadline: None,
            version: None,
        }
    }

    fn world(records: &[TaskRecord]) -> BTreeMap<String, TaskRecord> {
        records
            .iter()
            .map(|r| (r.id.to_string(), r.clone()))
            .collect()
    }

    fn state(id: ClientId, records: &[TaskRecord]) -> ClientState {
        ClientState {
            id,
            records: world(records),
            unsent: 0,
        }
    }

    #[test]
    fn identical_clients_pass_everything() {
        let records = [
            record("p", None, Some(5.0)),
            record("a", Some("p"), Some(0.0)),
            record("b", Some("p"), Some(1.0)),
        ];
        let server = world(&records);
        let states = [state(0, &records), state(1, &records)];
        let result = ConvergenceOracle::check_all(&states, &server);
        assert!(result.passed, "{:?}", result.violations);
        assert!(ConvergenceOracle::evaluate(&states, &server).converged);
    }

    #[test]
    fn divergent_field_is_named() {
        let server = world(&[record("a", None, Some(1.0))]);
        let mut changed = record("a", None, Some(1.0));
        changed.title = "other".into();
        let states = [state(0, &[changed])];
        let result = ConvergenceOracle::check_convergence(&states, &server);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Divergent {
                client: 0,
                task: "a".into(),
                fields: vec!["title".into()],
            }]
        );
        assert_eq!(ConvergenceOracle::evaluate(&states, &server).divergent_clients, vec![0]);
    }

    #[test]
    fn missing_and_extra_tasks_are_reported() {
        let server = world(&[record("a", None, None)]);
        let states = [state(3, &[record("z", None, None)])];
        let result = ConvergenceOracle::check_convergence(&states, &server);
        assert_eq!(result.violations.len(), 2);
        assert!(matches!(result.violations[0], InvariantViolation::MissingTask { client: 3, .. }));
        assert!(matches!(result.violations[1], InvariantViolation::UnexpectedTask { client: 3, .. }));
    }

    #[test]
    fn unsent_changes_fail_delivery() {
        let mut s = state(1, &[]);
        s.unsent = 2;
        let result = ConvergenceOracle::check_delivery(&[s]);
        assert_eq!(result.violations, vec![InvariantViolation::Unsent { client: 1, count: 2 }]);
    }

    #[test]
    fn parent_loops_are_cycles() {
        let states = [state(
            0,
            &[record("a", Some("b"), Some(0.0)), record("b", Some("a"), Some(0.0))],
        )];
        let result = ConvergenceOracle::check_acyclic(&states);
        assert_eq!(result.violations.len(), 2);
    }

    #[test]
    fn tied_or_missing_sibling_orders_are_flagged() {
        let tied = [
            record("a", Some("p"), Some(1.0)),
            record("b", Some("p"), Some(1.0)),
        ];
        assert!(!ConvergenceOracle::check_sibling_order(&[state(0, &tied)]).passed);

        let unordered = [record("a", Some("p"), None)];
        assert!(!ConvergenceOracle::check_sibling_order(&[state(0, &unordered)]).passed);
    }

    #[test]
    fn violations_render_readably() {
        let v = InvariantViolation::Unsent { client: 2, count: 1 };
        assert!(v.to_string().starts_with("Unsent: client 2"));
    }
}
