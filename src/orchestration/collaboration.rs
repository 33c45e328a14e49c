//! Multi-agent collaboration.
//!
//! The coordinator is a pure state machine: it never touches capacity or
//! dispatches work itself. Every call returns [`SessionAction`]s that the
//! scheduler carries out, in order.
//!
//! Capacity rules:
//! - a participant holds a slot from session open (or from a `Hold`) until
//!   it reports or is cancelled
//! - the scheduler releases the reporting participant's slot *before*
//!   handing its result to the coordinator
//! - hierarchical workers hold no slot in the session; their child tasks
//!   reserve like any other task

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentId;
use crate::config::{CollaborationConfig, ConsensusPolicyKind};
use crate::core::task::{CollaborationStrategy, Quorum, SessionId, Task, TaskId};
use crate::error::{Error, Result};

/// What a participant is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Execute,
    /// Hierarchical coordinator splitting the work.
    Plan,
    /// Hierarchical coordinator combining child results.
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Coordinator,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// In the group, no work handed out yet.
    Waiting,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub agent: AgentId,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub holds_slot: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl Participant {
    fn new(agent: AgentId, role: ParticipantRole, holds_slot: bool) -> Self {
        Self {
            agent,
            role,
            status: ParticipantStatus::Waiting,
            holds_slot,
            output: None,
            error: None,
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.status,
            ParticipantStatus::Dispatched | ParticipantStatus::Running
        )
    }
}

/// Where a session is in its strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Running,
    AwaitingChildren,
    Aggregating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub id: SessionId,
    pub task: TaskId,
    pub strategy: CollaborationStrategy,
    pub participants: Vec<Participant>,
    pub quorum: Quorum,
    pub phase: SessionPhase,
    /// Consensus round, starting at 1.
    pub round: u32,
    prompt: String,
    children: Vec<TaskId>,
    child_results: BTreeMap<TaskId, ChildResult>,
}

impl CollaborationSession {
    pub fn agents(&self) -> Vec<AgentId> {
        self.participants.iter().map(|p| p.agent).collect()
    }

    pub fn participant(&self, agent: &AgentId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.agent == agent)
    }

    fn participant_mut(&mut self, agent: &AgentId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.agent == agent)
    }

    /// Agents currently holding a reservation for this session.
    pub fn holders(&self) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|p| p.holds_slot)
            .map(|p| p.agent)
            .collect()
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, SessionPhase::Completed | SessionPhase::Failed)
    }

    fn coordinator(&self) -> Option<AgentId> {
        self.participants
            .iter()
            .find(|p| p.role == ParticipantRole::Coordinator)
            .map(|p| p.agent)
    }

    fn workers(&self) -> Vec<AgentId> {
        self.participants
            .iter()
            .filter(|p| p.role == ParticipantRole::Worker)
            .map(|p| p.agent)
            .collect()
    }

    fn cancel_holders(&mut self) -> Vec<AgentId> {
        let mut agents = Vec::new();
        for p in &mut self.participants {
            if p.holds_slot {
                p.holds_slot = false;
                if p.is_active() || p.status == ParticipantStatus::Waiting {
                    p.status = ParticipantStatus::Cancelled;
                }
                agents.push(p.agent);
            }
        }
        agents
    }

    fn dispatch(&mut self, agent: AgentId, stage: Stage, input: Value) -> SessionAction {
        if let Some(p) = self.participant_mut(&agent) {
            p.status = ParticipantStatus::Dispatched;
            p.output = None;
            p.error = None;
        }
        SessionAction::Dispatch {
            agent,
            stage,
            input,
        }
    }

    fn fail(&mut self, error: String) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let holders = self.cancel_holders();
        if !holders.is_empty() {
            actions.push(SessionAction::Cancel { agents: holders });
        }
        self.phase = SessionPhase::Failed;
        actions.push(SessionAction::Fail { error });
        actions
    }

    fn complete(&mut self, output: Value) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let holders = self.cancel_holders();
        if !holders.is_empty() {
            actions.push(SessionAction::Cancel { agents: holders });
        }
        self.phase = SessionPhase::Completed;
        actions.push(SessionAction::Complete { output });
        actions
    }
}

/// Side effects requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Hand work to a participant that already holds a slot.
    Dispatch {
        agent: AgentId,
        stage: Stage,
        input: Value,
    },
    /// Re-reserve a slot for a participant that just reported.
    Hold { agent: AgentId },
    /// Drop the reservations of these agents and cancel their work.
    Cancel { agents: Vec<AgentId> },
    /// Create child tasks, each pinned to its agent.
    SpawnChildren { children: Vec<(AgentId, String)> },
    Complete { output: Value },
    Fail { error: String },
}

/// One participant's successful answer in a consensus round.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub agent: AgentId,
    pub output: Value,
}

/// Result of evaluating a consensus round.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    /// In `[0, 1]`.
    pub score: f64,
    pub decision: Value,
}

/// Agreement function for consensus collaboration.
pub trait ConsensusPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Score a round. `participants` counts every participant, including
    /// ones that failed to vote.
    fn evaluate(&self, votes: &[Vote], participants: usize) -> Option<Agreement>;
}

/// The most common answer wins; agreement is its share of all participants.
///
/// Answers compare on their `answer` field when present, otherwise on the
/// whole output.
#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityVote;

impl ConsensusPolicy for MajorityVote {
    fn name(&self) -> &'static str {
        "majority_vote"
    }

    fn evaluate(&self, votes: &[Vote], participants: usize) -> Option<Agreement> {
        if votes.is_empty() || participants == 0 {
            return None;
        }
        let key = |v: &Vote| v.output.get("answer").unwrap_or(&v.output).to_string();

        // First-seen order breaks ties between equally sized groups
        let mut groups: Vec<(String, usize, &Vote)> = Vec::new();
        for vote in votes {
            let k = key(vote);
            match groups.iter_mut().find(|(gk, _, _)| *gk == k) {
                Some(group) => group.1 += 1,
                None => groups.push((k, 1, vote)),
            }
        }
        let mut best = &groups[0];
        for group in &groups[1..] {
            if group.1 > best.1 {
                best = group;
            }
        }
        Some(Agreement {
            score: best.1 as f64 / participants as f64,
            decision: best.2.output.clone(),
        })
    }
}

/// The answer with the highest self-reported `confidence` wins; agreement
/// is that confidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestConfidence;

impl HighestConfidence {
    fn confidence(output: &Value) -> f64 {
        output
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

impl ConsensusPolicy for HighestConfidence {
    fn name(&self) -> &'static str {
        "highest_confidence"
    }

    fn evaluate(&self, votes: &[Vote], _participants: usize) -> Option<Agreement> {
        let mut best: Option<(&Vote, f64)> = None;
        for vote in votes {
            let c = Self::confidence(&vote.output);
            if best.map_or(true, |(_, b)| c > b) {
                best = Some((vote, c));
            }
        }
        best.map(|(vote, score)| Agreement {
            score,
            decision: vote.output.clone(),
        })
    }
}

pub fn policy_for(kind: ConsensusPolicyKind) -> Box<dyn ConsensusPolicy> {
    match kind {
        ConsensusPolicyKind::MajorityVote => Box::new(MajorityVote),
        ConsensusPolicyKind::HighestConfidence => Box::new(HighestConfidence),
    }
}

/// Outcome reported by a participant or child task.
pub type StepResult = std::result::Result<Value, String>;

/// Runs collaboration sessions.
#[derive(Debug)]
pub struct CollaborationCoordinator {
    sessions: HashMap<SessionId, CollaborationSession>,
    by_task: HashMap<TaskId, SessionId>,
    policy: Box<dyn ConsensusPolicy>,
    threshold: f64,
    max_rounds: u32,
    default_quorum: Quorum,
}

impl CollaborationCoordinator {
    pub fn new(config: &CollaborationConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            by_task: HashMap::new(),
            policy: policy_for(config.consensus_policy),
            threshold: config.consensus_threshold,
            max_rounds: config.consensus_rounds.max(1),
            default_quorum: config.default_quorum,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn ConsensusPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self, id: &SessionId) -> Option<&CollaborationSession> {
        self.sessions.get(id)
    }

    pub fn session_for_task(&self, task: &TaskId) -> Option<&CollaborationSession> {
        self.by_task.get(task).and_then(|id| self.sessions.get(id))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Agents that must hold a slot when the session opens.
    pub fn initial_holders(strategy: CollaborationStrategy, group: &[AgentId]) -> Vec<AgentId> {
        match strategy {
            CollaborationStrategy::Hierarchical => group.iter().take(1).copied().collect(),
            _ => group.to_vec(),
        }
    }

    /// Open a session for `task` with an already reserved group.
    ///
    /// The scheduler must have reserved [`Self::initial_holders`] before
    /// calling this.
    pub fn open(
        &mut self,
        task: &Task,
        group: Vec<AgentId>,
    ) -> Result<(SessionId, Vec<SessionAction>)> {
        let spec = task.collaboration.as_ref().ok_or_else(|| {
            Error::Validation(format!("task {} is not collaborative", task.id.short()))
        })?;
        if group.is_empty() {
            return Err(Error::Validation("collaboration group is empty".to_string()));
        }
        if spec.strategy == CollaborationStrategy::Hierarchical && group.len() < 2 {
            return Err(Error::Validation(
                "hierarchical collaboration needs a coordinator and at least one worker"
                    .to_string(),
            ));
        }

        let participants = group
            .iter()
            .enumerate()
            .map(|(i, agent)| match spec.strategy {
                CollaborationStrategy::Hierarchical if i == 0 => {
                    Participant::new(*agent, ParticipantRole::Coordinator, true)
                }
                CollaborationStrategy::Hierarchical => {
                    Participant::new(*agent, ParticipantRole::Worker, false)
                }
                _ => Participant::new(*agent, ParticipantRole::Member, true),
            })
            .collect();

        let mut session = CollaborationSession {
            id: SessionId::new(),
            task: task.id,
            strategy: spec.strategy,
            participants,
            quorum: spec.quorum.unwrap_or(self.default_quorum),
            phase: SessionPhase::Running,
            round: 1,
            prompt: task.prompt.clone(),
            children: Vec::new(),
            child_results: BTreeMap::new(),
        };

        let actions = match spec.strategy {
            CollaborationStrategy::Sequential => {
                let input = json!({ "prompt": session.prompt, "previous": [] });
                vec![session.dispatch(group[0], Stage::Execute, input)]
            }
            CollaborationStrategy::Parallel => {
                let input = json!({ "prompt": session.prompt });
                group
                    .iter()
                    .map(|a| session.dispatch(*a, Stage::Execute, input.clone()))
                    .collect()
            }
            CollaborationStrategy::Consensus => {
                let input = json!({ "prompt": session.prompt, "round": 1 });
                group
                    .iter()
                    .map(|a| session.dispatch(*a, Stage::Execute, input.clone()))
                    .collect()
            }
            CollaborationStrategy::Hierarchical => {
                let input = json!({
                    "prompt": session.prompt,
                    "workers": group.len() - 1,
                });
                vec![session.dispatch(group[0], Stage::Plan, input)]
            }
        };

        let id = session.id;
        tracing::info!(
            session = %id,
            task = %task.id.short(),
            strategy = %spec.strategy,
            participants = group.len(),
            "collaboration session opened"
        );
        self.by_task.insert(task.id, id);
        self.sessions.insert(id, session);
        Ok((id, actions))
    }

    /// A participant acknowledged its work. Returns false for stale reports.
    pub fn on_started(&mut self, session: &SessionId, agent: &AgentId) -> bool {
        let Some(p) = self
            .sessions
            .get_mut(session)
            .and_then(|s| s.participant_mut(agent))
        else {
            return false;
        };
        if p.status != ParticipantStatus::Dispatched {
            return false;
        }
        p.status = ParticipantStatus::Running;
        true
    }

    /// Whether `agent` has outstanding work in the session.
    pub fn is_active(&self, session: &SessionId, agent: &AgentId) -> bool {
        self.sessions
            .get(session)
            .and_then(|s| s.participant(agent))
            .is_some_and(Participant::is_active)
    }

    /// A participant finished. The scheduler has already released its slot.
    ///
    /// Returns `None` when the report does not match outstanding work.
    pub fn on_result(
        &mut self,
        session_id: &SessionId,
        agent: &AgentId,
        result: StepResult,
    ) -> Option<Vec<SessionAction>> {
        let session = self.sessions.get_mut(session_id)?;
        let participant = session.participant_mut(agent)?;
        if !participant.is_active() {
            return None;
        }
        participant.holds_slot = false;
        match result {
            Ok(output) => {
                participant.status = ParticipantStatus::Succeeded;
                participant.output = Some(output);
            }
            Err(error) => {
                participant.status = ParticipantStatus::Failed;
                participant.error = Some(error);
            }
        }

        let actions = match session.strategy {
            CollaborationStrategy::Sequential => step_sequential(session, agent),
            CollaborationStrategy::Parallel => step_parallel(session),
            CollaborationStrategy::Consensus => step_consensus(
                session,
                agent,
                self.policy.as_ref(),
                self.threshold,
                self.max_rounds,
            ),
            CollaborationStrategy::Hierarchical => step_hierarchical(session, agent),
        };
        Some(actions)
    }

    /// Record the child tasks created for a hierarchical session.
    pub fn attach_children(&mut self, session: &SessionId, children: Vec<TaskId>) {
        if let Some(s) = self.sessions.get_mut(session) {
            s.children.extend(children);
        }
    }

    /// A child task reached a terminal state.
    pub fn on_child_finished(
        &mut self,
        session_id: &SessionId,
        child: TaskId,
        result: StepResult,
    ) -> Vec<SessionAction> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        if session.phase != SessionPhase::AwaitingChildren || !session.children.contains(&child)
        {
            return Vec::new();
        }
        let entry = match result {
            Ok(output) => ChildResult {
                success: true,
                output: Some(output),
                error: None,
            },
            Err(error) => ChildResult {
                success: false,
                output: None,
                error: Some(error),
            },
        };
        session.child_results.insert(child, entry);
        if session.child_results.len() < session.children.len() {
            return Vec::new();
        }

        let total = session.children.len();
        let successes = session.child_results.values().filter(|r| r.success).count();
        if !session.quorum.is_met(successes, total) {
            return session.fail(
                Error::CollaborationQuorumFailure(format!(
                    "{} of {} child tasks succeeded, {} required",
                    successes,
                    total,
                    session.quorum.required(total)
                ))
                .to_string(),
            );
        }

        let Some(coordinator) = session.coordinator() else {
            return session.fail("hierarchical session lost its coordinator".to_string());
        };
        let results: Vec<Value> = session
            .children
            .iter()
            .filter_map(|id| {
                session.child_results.get(id).map(|r| {
                    json!({
                        "task": id,
                        "success": r.success,
                        "output": r.output,
                        "error": r.error,
                    })
                })
            })
            .collect();
        let input = json!({ "prompt": session.prompt, "results": results });
        session.phase = SessionPhase::Aggregating;
        vec![session.dispatch(coordinator, Stage::Aggregate, input)]
    }

    /// Note that the scheduler re-reserved a slot after a `Hold`, or could
    /// not.
    pub fn set_holding(&mut self, session: &SessionId, agent: &AgentId, holding: bool) {
        if let Some(p) = self
            .sessions
            .get_mut(session)
            .and_then(|s| s.participant_mut(agent))
        {
            p.holds_slot = holding;
        }
    }

    /// Abandon a session. Returns the agents whose reservations must be
    /// cancelled and the child tasks still attached.
    pub fn abort(&mut self, session_id: &SessionId) -> (Vec<AgentId>, Vec<TaskId>) {
        let Some(mut session) = self.close(session_id) else {
            return (Vec::new(), Vec::new());
        };
        let holders = session.cancel_holders();
        let children = session
            .children
            .iter()
            .filter(|c| !session.child_results.contains_key(c))
            .copied()
            .collect();
        tracing::info!(session = %session_id, "collaboration session aborted");
        (holders, children)
    }

    /// Remove a session. Returns it for inspection.
    pub fn close(&mut self, session_id: &SessionId) -> Option<CollaborationSession> {
        let session = self.sessions.remove(session_id)?;
        self.by_task.remove(&session.task);
        Some(session)
    }
}

fn step_sequential(session: &mut CollaborationSession, agent: &AgentId) -> Vec<SessionAction> {
    let Some(pos) = session.participants.iter().position(|p| &p.agent == agent) else {
        return Vec::new();
    };
    if let Some(error) = session.participants[pos].error.clone() {
        return session.fail(format!("sequential step {} failed: {}", pos + 1, error));
    }

    let previous: Vec<Value> = session.participants[..=pos]
        .iter()
        .filter_map(|p| p.output.clone())
        .collect();
    match session.participants.get(pos + 1).map(|p| p.agent) {
        Some(next) => {
            let input = json!({ "prompt": session.prompt, "previous": previous });
            vec![session.dispatch(next, Stage::Execute, input)]
        }
        None => {
            let output = previous.last().cloned().unwrap_or(Value::Null);
            session.complete(output)
        }
    }
}

fn step_parallel(session: &mut CollaborationSession) -> Vec<SessionAction> {
    if session.participants.iter().any(Participant::is_active) {
        return Vec::new();
    }
    let total = session.participants.len();
    let successes = session
        .participants
        .iter()
        .filter(|p| p.status == ParticipantStatus::Succeeded)
        .count();
    if !session.quorum.is_met(successes, total) {
        return session.fail(
            Error::CollaborationQuorumFailure(format!(
                "{} of {} participants succeeded, {} required",
                successes,
                total,
                session.quorum.required(total)
            ))
            .to_string(),
        );
    }

    let mut results = serde_json::Map::new();
    let mut errors = serde_json::Map::new();
    for p in &session.participants {
        if let Some(output) = &p.output {
            results.insert(p.agent.to_string(), output.clone());
        }
        if let Some(error) = &p.error {
            errors.insert(p.agent.to_string(), Value::String(error.clone()));
        }
    }
    session.complete(json!({
        "results": results,
        "errors": errors,
        "succeeded": successes,
        "failed": total - successes,
    }))
}

fn step_consensus(
    session: &mut CollaborationSession,
    agent: &AgentId,
    policy: &dyn ConsensusPolicy,
    threshold: f64,
    max_rounds: u32,
) -> Vec<SessionAction> {
    let mut actions = Vec::new();
    if session.round < max_rounds {
        // Keep the slot for a possible next round
        if let Some(p) = session.participant_mut(agent) {
            p.holds_slot = true;
        }
        actions.push(SessionAction::Hold { agent: *agent });
    }
    if session.participants.iter().any(Participant::is_active) {
        return actions;
    }

    let votes: Vec<Vote> = session
        .participants
        .iter()
        .filter_map(|p| {
            p.output.clone().map(|output| Vote {
                agent: p.agent,
                output,
            })
        })
        .collect();
    let total = session.participants.len();
    let agreement = policy.evaluate(&votes, total);
    let score = agreement.as_ref().map_or(0.0, |a| a.score);
    tracing::debug!(
        session = %session.id,
        round = session.round,
        policy = policy.name(),
        score,
        threshold,
        "consensus round evaluated"
    );

    if let Some(agreement) = agreement.filter(|a| a.score >= threshold) {
        let output = json!({
            "decision": agreement.decision,
            "agreement": agreement.score,
            "rounds": session.round,
        });
        actions.extend(session.complete(output));
        return actions;
    }

    if session.round >= max_rounds {
        actions.extend(session.fail(
            Error::CollaborationQuorumFailure(format!(
                "no consensus after {} round(s): agreement {:.2} below {:.2}",
                session.round, score, threshold
            ))
            .to_string(),
        ));
        return actions;
    }

    session.round += 1;
    let previous: Vec<Value> = votes.iter().map(|v| v.output.clone()).collect();
    let input = json!({
        "prompt": session.prompt,
        "round": session.round,
        "previous_round": previous,
    });
    let agents = session.agents();
    for a in agents {
        actions.push(session.dispatch(a, Stage::Execute, input.clone()));
    }
    actions
}

fn step_hierarchical(session: &mut CollaborationSession, agent: &AgentId) -> Vec<SessionAction> {
    let Some(p) = session.participant(agent) else {
        return Vec::new();
    };
    if p.role != ParticipantRole::Coordinator {
        return Vec::new();
    }
    if let Some(error) = p.error.clone() {
        let stage = if session.phase == SessionPhase::Aggregating {
            "aggregation"
        } else {
            "planning"
        };
        return session.fail(format!("coordinator {} failed: {}", stage, error));
    }
    let output = p.output.clone().unwrap_or(Value::Null);

    if session.phase == SessionPhase::Aggregating {
        return session.complete(output);
    }

    let workers = session.workers();
    let prompts: Vec<String> = match output.as_array() {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => vec![session.prompt.clone(); workers.len()],
    };
    let children = prompts
        .into_iter()
        .enumerate()
        .map(|(i, prompt)| (workers[i % workers.len()], prompt))
        .collect();

    // Coordinator keeps its slot for the aggregation pass
    if let Some(p) = session.participant_mut(agent) {
        p.holds_slot = true;
        p.status = ParticipantStatus::Waiting;
    }
    session.phase = SessionPhase::AwaitingChildren;
    vec![
        SessionAction::Hold { agent: *agent },
        SessionAction::SpawnChildren { children },
    ]
}
