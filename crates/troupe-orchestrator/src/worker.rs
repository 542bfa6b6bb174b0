//! Agent worker boundary
//!
//! One worker drives one agent's state machine step by step. Errors and
//! panics raised inside a step are caught here and turned into an ERROR
//! transition with the cause recorded, so a failing agent never takes the
//! dispatcher or its peers down. Cancellation is the exception: the agent is
//! left in its current state so it can be persisted and resumed.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use troupe_core::fail_open::fail_open;
use troupe_core::{AgentId, AgentType, Result};

use crate::dispatcher::Agent;
use crate::state_machine::StateSnapshot;
use crate::store::StateStore;

/// How an agent finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub final_state: String,
    /// Completion summary for DONE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Recorded cause for ERROR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl AgentOutcome {
    pub fn is_done(&self) -> bool {
        self.final_state == "DONE"
    }
}

/// An agent that can be advanced one iteration at a time
#[async_trait]
pub trait AgentWorker: Agent {
    /// Run one iteration of the current state
    async fn step(&mut self, cancel: &CancellationToken) -> Result<()>;

    fn is_finished(&self) -> bool;

    /// Force ERROR with `cause`; `false` if already terminal
    fn fail(&mut self, cause: &str) -> Result<bool>;

    fn snapshot(&self) -> StateSnapshot;

    fn outcome(&self) -> AgentOutcome;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn persist(snapshot: StateSnapshot, store: Option<&StateStore>) {
    if let Some(store) = store {
        fail_open("state_store::save", || store.save(&snapshot)).await;
    }
}

/// Step `agent` until it reaches a terminal state
///
/// Returns `Err` only for cancellation or when the ERROR transition itself
/// cannot be committed.
pub async fn run_agent<A: AgentWorker + ?Sized>(
    agent: &mut A,
    store: Option<&StateStore>,
    cancel: &CancellationToken,
) -> Result<AgentOutcome> {
    info!("Worker started for {} {}", agent.agent_type(), agent.id());

    while !agent.is_finished() {
        let stepped = AssertUnwindSafe(agent.step(cancel)).catch_unwind().await;
        match stepped {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancellation() => {
                warn!("{} stopped: {}", agent.id(), e);
                persist(agent.snapshot(), store).await;
                return Err(e);
            }
            Ok(Err(e)) => {
                error!("{} failed: {}", agent.id(), e);
                agent.fail(&e.to_string())?;
            }
            Err(payload) => {
                let cause = format!("panic: {}", panic_message(payload.as_ref()));
                error!("{} {}", agent.id(), cause);
                agent.fail(&cause)?;
            }
        }
        persist(agent.snapshot(), store).await;
    }

    let outcome = agent.outcome();
    info!("{} finished in {}", outcome.agent_id, outcome.final_state);
    Ok(outcome)
}

/// Move `agent` onto its own task
pub fn spawn_worker<A>(
    mut agent: A,
    store: Option<StateStore>,
    cancel: CancellationToken,
) -> JoinHandle<Result<AgentOutcome>>
where
    A: AgentWorker + 'static,
{
    tokio::spawn(async move { run_agent(&mut agent, store.as_ref(), &cancel).await })
}
