//! Generic agent state machine
//!
//! Each agent owns exactly one [`StateMachine`] parameterized by its state
//! enum. The engine knows nothing about what states mean; it only:
//! - validates every transition against the state type's edge table
//! - holds the agent's free-form StateData
//! - publishes one notification per committed transition
//!
//! Illegal transitions return `InvalidTransition` and leave the machine
//! untouched. Control-flow fields (loop counters, plans, origin states) live
//! on the concrete agent, not in StateData.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, info};
use troupe_core::{AgentId, AgentType, Result, StateChangeNotification, TroupeError};

use crate::notifications::StateNotifier;

/// Free-form per-agent working context
pub type StateData = Map<String, Value>;

/// Key under which the cause of a forced ERROR is recorded
pub const ERROR_KEY: &str = "error";

/// A closed set of states with a fixed edge table
pub trait AgentState: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Agent kind this state set belongs to
    const AGENT_TYPE: AgentType;

    fn initial() -> Self;

    /// The ERROR state every non-terminal state may fall into
    fn error() -> Self;

    fn all() -> &'static [Self];

    /// Legal next states
    fn successors(&self) -> &'static [Self];

    /// Canonical upper-case name
    fn as_str(&self) -> &'static str;

    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    fn can_transition_to(&self, next: Self) -> bool {
        self.successors().contains(&next)
    }

    fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.as_str() == name)
    }
}

/// Serializable `(agent, state, data)` unit used for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub state: String,
    #[serde(default)]
    pub state_data: StateData,
    /// Agent-specific typed progress (counters, plans, context)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    pub saved_at: DateTime<Utc>,
}

/// State holder with transition validation
#[derive(Debug)]
pub struct StateMachine<S: AgentState> {
    agent_id: AgentId,
    current: S,
    data: StateData,
    notifier: Option<StateNotifier>,
    transitions: u64,
}

impl<S: AgentState> StateMachine<S> {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            current: S::initial(),
            data: StateData::new(),
            notifier: None,
            transitions: 0,
        }
    }

    /// Route future transition notifications to `notifier`
    pub fn attach_notifier(&mut self, notifier: StateNotifier) {
        self.notifier = Some(notifier);
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn agent_type(&self) -> AgentType {
        S::AGENT_TYPE
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Number of transitions committed by this machine
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Move to `next` if the edge exists, then publish a notification
    pub fn transition_to(&mut self, next: S) -> Result<()> {
        let from = self.current;
        if !from.can_transition_to(next) {
            return Err(TroupeError::InvalidTransition {
                agent_type: S::AGENT_TYPE,
                from: from.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        self.current = next;
        self.transitions += 1;
        info!("{}: {} -> {}", self.agent_id, from.as_str(), next.as_str());

        if let Some(notifier) = &self.notifier {
            notifier.publish(StateChangeNotification {
                agent_id: self.agent_id.clone(),
                agent_type: S::AGENT_TYPE,
                from_state: from.as_str().to_string(),
                to_state: next.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Move to ERROR from any non-terminal state, recording `cause`
    ///
    /// Returns `false` when the machine was already terminal.
    pub fn force_error(&mut self, cause: &str) -> Result<bool> {
        if self.current.is_terminal() {
            debug!(
                "{}: ignoring error in terminal state {}: {}",
                self.agent_id,
                self.current.as_str(),
                cause
            );
            return Ok(false);
        }
        self.data
            .insert(ERROR_KEY.to_string(), Value::String(cause.to_string()));
        self.transition_to(S::error())?;
        Ok(true)
    }

    /// Resolve a state name within this agent type's state set
    pub fn validate_state(&self, name: &str) -> Result<S> {
        S::parse(name).ok_or_else(|| TroupeError::UnknownState {
            agent_type: S::AGENT_TYPE,
            state: name.to_string(),
        })
    }

    /// Copy of the current StateData
    pub fn state_data(&self) -> StateData {
        self.data.clone()
    }

    pub fn set_state_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    pub fn remove_state_data(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Append `value` to the array stored under `key`, creating it if needed
    pub fn push_state_data(&mut self, key: &str, value: impl Into<Value>) {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value.into()),
            other => *other = Value::Array(vec![other.take(), value.into()]),
        }
    }

    pub fn snapshot(&self, progress: Option<Value>) -> StateSnapshot {
        StateSnapshot {
            agent_id: self.agent_id.clone(),
            agent_type: S::AGENT_TYPE,
            state: self.current.as_str().to_string(),
            state_data: self.data.clone(),
            progress,
            saved_at: Utc::now(),
        }
    }

    /// Rebuild a machine from a snapshot of the same agent type
    ///
    /// No notification is published; restoring is not a transition.
    pub fn restore(snapshot: &StateSnapshot) -> Result<Self> {
        if snapshot.agent_type != S::AGENT_TYPE {
            return Err(TroupeError::Protocol(format!(
                "snapshot for {} is a {} snapshot, expected {}",
                snapshot.agent_id,
                snapshot.agent_type,
                S::AGENT_TYPE
            )));
        }

        let mut machine = Self::new(snapshot.agent_id.clone());
        machine.current = machine.validate_state(&snapshot.state)?;
        machine.data = snapshot.state_data.clone();
        Ok(machine)
    }
}
