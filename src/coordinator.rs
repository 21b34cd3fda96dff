//! Role assignment and task bidding across orchestrator instances
//!
//! A session moves forming -> electing -> active, and through rebalancing
//! back to active whenever a node leaves or load skews. Active sessions award
//! each task to the bidder with idle capacity and the best score.

use crate::config::CoordinationConfig;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::protocol::{Task, TaskId, TaskResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Forming,
    Electing,
    Active,
    Rebalancing,
}

/// Role a node plays inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Arbitrates bids; still takes work when it has capacity
    Leader,
    /// Holds no free capacity and sits out bidding
    Follower,
    /// Competes for tasks
    Bidder,
}

/// How roles are assigned and bids scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    /// Leadership rotates every election; tasks rotate over bidders
    RoundRobin,
    /// Broadest node leads; specialists with free capacity win bids
    #[default]
    CapabilityWeighted,
    /// Narrowest node auctions; the most idle bidder wins
    Auction,
}

impl fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::CapabilityWeighted => "capability_weighted",
            Self::Auction => "auction",
        };
        f.write_str(s)
    }
}

/// An orchestrator instance that can take part in a session
#[async_trait]
pub trait CoordinationNode: Send + Sync {
    fn node_id(&self) -> &str;

    /// Capability tags the node can serve
    fn capabilities(&self) -> Vec<String>;

    /// Tasks the node accepts at once
    fn capacity(&self) -> usize;

    /// Runs a task to a terminal result
    async fn execute(&self, task: Task) -> TaskResult;
}

/// One node's offer for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub node_id: String,
    pub score: f64,
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub strategy: CoordinationStrategy,
    pub leader: Option<String>,
    pub roles: BTreeMap<String, NodeRole>,
    pub in_flight: BTreeMap<String, usize>,
    /// Completed elections
    pub term: u64,
}

/// A task awarded to a node
pub struct Assignment {
    pub node_id: String,
    pub node: Arc<dyn CoordinationNode>,
    /// Fires when the node leaves before completing the task
    pub abandoned: oneshot::Receiver<()>,
}

impl std::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assignment")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

struct Member {
    node: Arc<dyn CoordinationNode>,
    role: Option<NodeRole>,
    in_flight: HashMap<TaskId, oneshot::Sender<()>>,
}

impl Member {
    fn idle_capacity(&self) -> usize {
        self.node.capacity().saturating_sub(self.in_flight.len())
    }

    fn serves(&self, requirements: &[String]) -> bool {
        let capabilities = self.node.capabilities();
        requirements.iter().all(|r| capabilities.contains(r))
    }
}

struct Session {
    state: SessionState,
    strategy: CoordinationStrategy,
    members: BTreeMap<String, Member>,
    leader: Option<String>,
    term: u64,
    cursor: usize,
}

/// Arbitrates sessions of cooperating nodes
pub struct DistributedCoordinator {
    config: CoordinationConfig,
    sessions: DashMap<String, Session>,
}

impl DistributedCoordinator {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            config: config.clone(),
            sessions: DashMap::new(),
        }
    }

    /// Opens a forming session; `None` uses the configured strategy
    pub fn create_session(&self, strategy: Option<CoordinationStrategy>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let strategy = strategy.unwrap_or(self.config.strategy);
        self.sessions.insert(
            id.clone(),
            Session {
                state: SessionState::Forming,
                strategy,
                members: BTreeMap::new(),
                leader: None,
                term: 0,
                cursor: 0,
            },
        );
        info!(session = %id, %strategy, "coordination session created");
        id
    }

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::Coordination(format!("unknown session {}", session_id)))?;
        f(&mut session)
    }

    /// Adds a node; nodes joining an active session start as bidders
    pub fn join(&self, session_id: &str, node: Arc<dyn CoordinationNode>) -> Result<()> {
        let node_id = node.node_id().to_string();
        self.with_session(session_id, |session| {
            if session.members.contains_key(&node_id) {
                return Err(OrchestratorError::Coordination(format!(
                    "node {} already joined",
                    node_id
                )));
            }
            let role = (session.state == SessionState::Active).then(|| role_for_load(node.as_ref(), 0));
            session.members.insert(
                node_id.clone(),
                Member {
                    node,
                    role,
                    in_flight: HashMap::new(),
                },
            );
            debug!(session = session_id, node = %node_id, "node joined");
            Ok(())
        })
    }

    /// Assigns roles and activates the session
    ///
    /// Fails with a coordination error when fewer nodes than the quorum are
    /// present; the session then stays where it was.
    pub fn elect(&self, session_id: &str) -> Result<SessionInfo> {
        let quorum = self.config.quorum.max(1);
        self.with_session(session_id, |session| {
            elect(session, quorum)?;
            Ok(info_of(session_id, session))
        })
    }

    /// Current view of a session
    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| info_of(session_id, &s))
    }

    /// Offers from every node able to take `task`, best first
    pub fn bid(&self, session_id: &str, task: &Task) -> Result<Vec<Bid>> {
        self.with_session(session_id, |session| collect_bids(session, task))
    }

    /// Awards `task` to the best bidder and tracks it as in flight there
    pub fn assign(&self, session_id: &str, task: &Task) -> Result<Assignment> {
        self.with_session(session_id, |session| {
            if let Some((holder, _)) = session
                .members
                .iter()
                .find(|(_, member)| member.in_flight.contains_key(&task.id))
            {
                return Err(OrchestratorError::Conflict(format!(
                    "task {} already in flight on {}",
                    task.id, holder
                )));
            }
            let bids = collect_bids(session, task)?;
            let winner = bids.first().ok_or_else(|| {
                OrchestratorError::Coordination(format!("no node can take task {}", task.id))
            })?;
            let node_id = winner.node_id.clone();
            let (tx, rx) = oneshot::channel();
            let member = session
                .members
                .get_mut(&node_id)
                .ok_or_else(|| OrchestratorError::Coordination(format!("node {} vanished", node_id)))?;
            member.in_flight.insert(task.id.clone(), tx);
            if member.idle_capacity() == 0 && member.role == Some(NodeRole::Bidder) {
                member.role = Some(NodeRole::Follower);
            }
            let node = Arc::clone(&member.node);
            session.cursor = session.cursor.wrapping_add(1);
            debug!(session = session_id, node = %node_id, task = %task.id, score = winner.score, "task awarded");
            Ok(Assignment {
                node_id,
                node,
                abandoned: rx,
            })
        })
    }

    /// Marks an awarded task finished
    pub fn complete(&self, session_id: &str, node_id: &str, task_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if let Some(member) = session.members.get_mut(node_id) {
                member.in_flight.remove(task_id);
                if member.role == Some(NodeRole::Follower) && member.idle_capacity() > 0 {
                    member.role = Some(NodeRole::Bidder);
                }
            }
        }
    }

    /// Removes a node, abandoning its in-flight tasks
    ///
    /// Returns the abandoned task ids. The session rebalances and re-elects;
    /// if the quorum is gone it stays in `Rebalancing` until nodes rejoin and
    /// `elect` succeeds.
    pub fn leave(&self, session_id: &str, node_id: &str) -> Result<Vec<TaskId>> {
        let quorum = self.config.quorum.max(1);
        self.with_session(session_id, |session| {
            let member = session
                .members
                .remove(node_id)
                .ok_or_else(|| OrchestratorError::Coordination(format!("node {} is not a member", node_id)))?;
            let mut orphaned = Vec::with_capacity(member.in_flight.len());
            for (task_id, abandon) in member.in_flight {
                let _ = abandon.send(());
                orphaned.push(task_id);
            }
            orphaned.sort();
            warn!(session = session_id, node = node_id, orphaned = orphaned.len(), "node left");

            if session.leader.as_deref() == Some(node_id) {
                session.leader = None;
            }
            if session.state == SessionState::Active {
                session.state = SessionState::Rebalancing;
                if let Err(err) = elect(session, quorum) {
                    warn!(session = session_id, "re-election failed: {}", err);
                }
            }
            Ok(orphaned)
        })
    }

    /// Rebalances when the in-flight spread reaches the skew threshold
    ///
    /// Returns whether a rebalance ran.
    pub fn detect_skew(&self, session_id: &str) -> Result<bool> {
        let quorum = self.config.quorum.max(1);
        let threshold = self.config.skew_threshold.max(1);
        self.with_session(session_id, |session| {
            if session.state != SessionState::Active {
                return Ok(false);
            }
            let loads: Vec<usize> = session.members.values().map(|m| m.in_flight.len()).collect();
            let (Some(max), Some(min)) = (loads.iter().max(), loads.iter().min()) else {
                return Ok(false);
            };
            if max - min < threshold {
                return Ok(false);
            }
            info!(session = session_id, spread = max - min, "load skew detected");
            session.state = SessionState::Rebalancing;
            elect(session, quorum)?;
            Ok(true)
        })
    }

    /// Bids, awards and runs `task`, always producing a result
    ///
    /// Coordination failures and a winner leaving mid-task yield a failed
    /// result the caller may resubmit.
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub async fn dispatch(&self, session_id: &str, task: Task) -> TaskResult {
        let started = Instant::now();
        let assignment = match self.assign(session_id, &task) {
            Ok(assignment) => assignment,
            Err(err) => return coordination_failure(&task, "coordinator", err.to_string()),
        };
        let Assignment {
            node_id,
            node,
            abandoned,
        } = assignment;

        let task_id = task.id.clone();
        let result = tokio::select! {
            result = node.execute(task.clone()) => result,
            _ = abandoned => coordination_failure(
                &task,
                &node_id,
                format!("node {} left before finishing", node_id),
            ),
        };
        self.complete(session_id, &node_id, &task_id);

        let mut result = result.with_metadata("node_id", json!(node_id));
        result.task_id = task_id;
        if result.execution_time.is_zero() {
            result.execution_time = started.elapsed();
        }
        result.normalized()
    }
}

fn role_for_load(node: &dyn CoordinationNode, in_flight: usize) -> NodeRole {
    if node.capacity() > in_flight {
        NodeRole::Bidder
    } else {
        NodeRole::Follower
    }
}

fn elect(session: &mut Session, quorum: usize) -> Result<()> {
    if session.members.len() < quorum {
        return Err(OrchestratorError::Coordination(format!(
            "quorum not reached: {} of {} nodes",
            session.members.len(),
            quorum
        )));
    }
    let previous = session.state;
    session.state = SessionState::Electing;

    let ids: Vec<&String> = session.members.keys().collect();
    let breadth = |id: &String| {
        let member = &session.members[id];
        member.node.capabilities().len() * member.node.capacity()
    };
    let leader = match session.strategy {
        CoordinationStrategy::RoundRobin => Some(ids[(session.term as usize) % ids.len()].clone()),
        CoordinationStrategy::CapabilityWeighted => ids
            .iter()
            .max_by(|a, b| breadth(a).cmp(&breadth(b)).then_with(|| b.cmp(a)))
            .map(|id| (*id).clone()),
        CoordinationStrategy::Auction => ids
            .iter()
            .min_by(|a, b| breadth(a).cmp(&breadth(b)).then_with(|| a.cmp(b)))
            .map(|id| (*id).clone()),
    };
    let Some(leader) = leader else {
        session.state = previous;
        return Err(OrchestratorError::Coordination("no leader candidate".into()));
    };

    for (id, member) in session.members.iter_mut() {
        member.role = Some(if *id == leader {
            NodeRole::Leader
        } else {
            role_for_load(member.node.as_ref(), member.in_flight.len())
        });
    }
    session.leader = Some(leader);
    session.term += 1;
    session.state = SessionState::Active;
    debug!(leader = ?session.leader, term = session.term, "roles elected");
    Ok(())
}

fn collect_bids(session: &Session, task: &Task) -> Result<Vec<Bid>> {
    if session.state != SessionState::Active {
        return Err(OrchestratorError::Coordination(format!(
            "session is {:?}, not active",
            session.state
        )));
    }
    let candidates: Vec<(&String, &Member)> = session
        .members
        .iter()
        .filter(|(_, m)| matches!(m.role, Some(NodeRole::Leader) | Some(NodeRole::Bidder)))
        .filter(|(_, m)| m.idle_capacity() > 0 && m.serves(&task.requirements))
        .collect();

    let count = candidates.len();
    let mut bids: Vec<Bid> = candidates
        .iter()
        .enumerate()
        .map(|(position, (id, member))| {
            let capacity = member.node.capacity().max(1) as f64;
            let idle = member.idle_capacity() as f64 / capacity;
            let score = match session.strategy {
                CoordinationStrategy::RoundRobin => {
                    let turn = (position + count - session.cursor % count) % count;
                    (count - turn) as f64 / count as f64
                }
                CoordinationStrategy::CapabilityWeighted => {
                    let advertised = member.node.capabilities().len().max(1) as f64;
                    let specialization = if task.requirements.is_empty() {
                        0.0
                    } else {
                        task.requirements.len() as f64 / advertised
                    };
                    0.5 * idle + 0.5 * specialization
                }
                CoordinationStrategy::Auction => idle,
            };
            Bid {
                node_id: (*id).clone(),
                score,
            }
        })
        .collect();
    bids.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    Ok(bids)
}

fn info_of(session_id: &str, session: &Session) -> SessionInfo {
    SessionInfo {
        session_id: session_id.to_string(),
        state: session.state,
        strategy: session.strategy,
        leader: session.leader.clone(),
        roles: session
            .members
            .iter()
            .filter_map(|(id, m)| m.role.map(|role| (id.clone(), role)))
            .collect(),
        in_flight: session
            .members
            .iter()
            .map(|(id, m)| (id.clone(), m.in_flight.len()))
            .collect(),
        term: session.term,
    }
}

fn coordination_failure(task: &Task, agent_id: &str, error: String) -> TaskResult {
    TaskResult::failure(task.id.clone(), agent_id, error)
        .with_metadata("failure_kind", json!(FailureKind::Coordination.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct StubNode {
        id: String,
        capabilities: Vec<String>,
        capacity: usize,
        gate: Option<Arc<Notify>>,
    }

    impl StubNode {
        fn new(id: &str, capabilities: &[&str], capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                capacity,
                gate: None,
            })
        }
    }

    #[async_trait]
    impl CoordinationNode for StubNode {
        fn node_id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        fn capacity(&self) -> usize {
            self.capacity
        }

        async fn execute(&self, task: Task) -> TaskResult {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            TaskResult::success(task.id, self.id.clone(), json!("done"))
        }
    }

    fn coordinator(quorum: usize) -> DistributedCoordinator {
        DistributedCoordinator::new(&CoordinationConfig {
            quorum,
            ..CoordinationConfig::default()
        })
    }

    #[test]
    fn test_election_requires_quorum() {
        let coordinator = coordinator(2);
        let session = coordinator.create_session(None);
        coordinator.join(&session, StubNode::new("a", &["code"], 1)).unwrap();

        let err = coordinator.elect(&session).unwrap_err();
        assert!(matches!(err, OrchestratorError::Coordination(_)));
        assert_eq!(coordinator.session(&session).unwrap().state, SessionState::Forming);

        coordinator.join(&session, StubNode::new("b", &["code", "research"], 2)).unwrap();
        let info = coordinator.elect(&session).unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.leader.as_deref(), Some("b"));
        assert_eq!(info.roles["a"], NodeRole::Bidder);
    }

    #[test]
    fn test_highest_bid_with_capacity_wins() {
        let coordinator = coordinator(1);
        let session = coordinator.create_session(Some(CoordinationStrategy::Auction));
        coordinator.join(&session, StubNode::new("small", &["code"], 1)).unwrap();
        coordinator.join(&session, StubNode::new("large", &["code"], 4)).unwrap();
        coordinator.join(&session, StubNode::new("idle", &[], 0)).unwrap();
        coordinator.elect(&session).unwrap();

        let task = Task::new("x").with_requirements(["code"]);
        let first = coordinator.assign(&session, &task).unwrap();
        let second = coordinator.assign(&session, &Task::new("y").with_requirements(["code"])).unwrap();
        assert_eq!(first.node_id, "large");
        // large is now 3/4 idle, small still fully idle
        assert_eq!(second.node_id, "small");

        let bids = coordinator.bid(&session, &Task::new("z").with_requirements(["research"])).unwrap();
        assert!(bids.is_empty());
    }

    #[test]
    fn test_reassigning_in_flight_task_is_rejected() {
        let coordinator = coordinator(1);
        let session = coordinator.create_session(None);
        coordinator.join(&session, StubNode::new("a", &["code"], 4)).unwrap();
        coordinator.elect(&session).unwrap();

        let task = Task::new("x").with_requirements(["code"]);
        let mut first = coordinator.assign(&session, &task).unwrap();
        let err = coordinator.assign(&session, &task).unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        assert_eq!(err.failure_kind(), Some(FailureKind::Coordination));
        assert!(matches!(first.abandoned.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        assert_eq!(coordinator.session(&session).unwrap().in_flight["a"], 1);

        coordinator.complete(&session, "a", &task.id);
        assert!(coordinator.assign(&session, &task).is_ok());
    }

    #[test]
    fn test_round_robin_rotates_leadership() {
        let coordinator = coordinator(1);
        let session = coordinator.create_session(Some(CoordinationStrategy::RoundRobin));
        for id in ["a", "b", "c"] {
            coordinator.join(&session, StubNode::new(id, &["code"], 2)).unwrap();
        }
        assert_eq!(coordinator.elect(&session).unwrap().leader.as_deref(), Some("a"));

        let orphaned = coordinator.leave(&session, "a").unwrap();
        assert!(orphaned.is_empty());
        let info = coordinator.session(&session).unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.term, 2);
        assert_eq!(info.leader.as_deref(), Some("c"));
    }

    #[test]
    fn test_skew_triggers_rebalance() {
        let coordinator = DistributedCoordinator::new(&CoordinationConfig {
            quorum: 1,
            skew_threshold: 2,
            strategy: CoordinationStrategy::Auction,
        });
        let session = coordinator.create_session(None);
        coordinator.join(&session, StubNode::new("busy", &["code"], 10)).unwrap();
        coordinator.join(&session, StubNode::new("quiet", &["code"], 1)).unwrap();
        coordinator.elect(&session).unwrap();
        assert!(!coordinator.detect_skew(&session).unwrap());

        for i in 0..4 {
            coordinator.assign(&session, &Task::new(format!("t{}", i))).unwrap();
        }
        assert!(coordinator.detect_skew(&session).unwrap());
        assert_eq!(coordinator.session(&session).unwrap().term, 2);
    }

    #[tokio::test]
    async fn test_dispatch_runs_on_winner() {
        let coordinator = coordinator(1);
        let session = coordinator.create_session(None);
        coordinator.join(&session, StubNode::new("a", &["code"], 1)).unwrap();
        coordinator.elect(&session).unwrap();

        let task = Task::new("x").with_requirements(["code"]);
        let result = coordinator.dispatch(&session, task.clone()).await;
        assert!(result.success);
        assert_eq!(result.task_id, task.id);
        assert_eq!(coordinator.session(&session).unwrap().in_flight["a"], 0);
    }

    #[tokio::test]
    async fn test_node_leaving_fails_its_task() {
        let coordinator = Arc::new(coordinator(1));
        let session = coordinator.create_session(None);
        let gate = Arc::new(Notify::new());
        let slow = Arc::new(StubNode {
            id: "slow".into(),
            capabilities: vec!["code".into()],
            capacity: 1,
            gate: Some(Arc::clone(&gate)),
        });
        coordinator.join(&session, slow).unwrap();
        coordinator.join(&session, StubNode::new("backup", &[], 1)).unwrap();
        coordinator.elect(&session).unwrap();

        let task = Task::new("x").with_requirements(["code"]);
        let handle = {
            let coordinator = Arc::clone(&coordinator);
            let session = session.clone();
            let task = task.clone();
            tokio::spawn(async move { coordinator.dispatch(&session, task).await })
        };
        while coordinator.session(&session).unwrap().in_flight.get("slow") != Some(&1) {
            tokio::task::yield_now().await;
        }

        let orphaned = coordinator.leave(&session, "slow").unwrap();
        assert_eq!(orphaned, vec![task.id.clone()]);

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata["failure_kind"], json!("coordination"));
        assert_eq!(coordinator.session(&session).unwrap().leader.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn test_dispatch_without_active_session_fails_softly() {
        let coordinator = coordinator(1);
        let session = coordinator.create_session(None);
        let result = coordinator.dispatch(&session, Task::new("x")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not active"));
    }
}
