//! # troupe-orchestrator
//!
//! Coordination runtime for Troupe.
//!
//! This crate provides:
//! - A generic state-machine engine with validated transitions
//! - The Coder workflow with budget-review escalation
//! - The Architect agent and its review contract
//! - The dispatcher routing messages and state notifications between agents
//! - The worker boundary that turns agent failures into ERROR transitions
//! - Durable JSON snapshots and the supervisor loop

pub mod architect;
mod collaborators;
pub mod coder;
mod dispatcher;
mod notifications;
pub mod scripted;
mod state_machine;
mod store;
mod supervisor;
mod worker;

pub use architect::{ArchitectAgent, ArchitectState, LlmReviewer, Reviewer};
pub use coder::{
    CoderAgent, CoderConfig, CoderProgress, CoderServices, CoderState, IssuePattern,
};
pub use collaborators::{
    ContainerMode, ContainerRuntime, ContextView, DefaultPromptRenderer, ExecOutput,
    PromptRenderer, WorkCheck, Workspace,
};
pub use dispatcher::{Agent, AgentChannels, Dispatcher};
pub use notifications::{NotificationQueue, StateChangeReceiver, StateNotifier};
pub use state_machine::{AgentState, StateData, StateMachine, StateSnapshot, ERROR_KEY};
pub use store::StateStore;
pub use supervisor::{is_terminal_state, FinishedAgent, Supervisor, SupervisorReport};
pub use worker::{run_agent, spawn_worker, AgentOutcome, AgentWorker};
