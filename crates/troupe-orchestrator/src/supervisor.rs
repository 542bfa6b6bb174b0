//! Supervisor loop
//!
//! Consumes the shared state-change queue, logs every transition and detaches
//! agents from the dispatcher once they reach DONE or ERROR. Notifications
//! may have been dropped under load, so a detach can lag but is never missed
//! for an agent whose terminal transition was observed.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use troupe_core::{AgentId, AgentType, Result, StateChangeNotification, TroupeError};

use crate::architect::ArchitectState;
use crate::coder::CoderState;
use crate::dispatcher::Dispatcher;
use crate::notifications::StateChangeReceiver;
use crate::state_machine::AgentState;

/// Whether `state` is terminal for agents of `agent_type`
pub fn is_terminal_state(agent_type: AgentType, state: &str) -> bool {
    match agent_type {
        AgentType::Coder => CoderState::parse(state).is_some_and(|s| s.is_terminal()),
        AgentType::Architect => ArchitectState::parse(state).is_some_and(|s| s.is_terminal()),
        AgentType::ProductManager => matches!(state, "DONE" | "ERROR"),
    }
}

/// An agent the supervisor saw finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedAgent {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub final_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorReport {
    pub finished: Vec<FinishedAgent>,
    /// Notifications consumed
    pub observed: u64,
    /// Notifications evicted before they were read
    pub dropped: u64,
}

pub struct Supervisor {
    dispatcher: Dispatcher,
    changes: StateChangeReceiver,
    report: SupervisorReport,
}

impl Supervisor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let changes = dispatcher.state_changes();
        Self {
            dispatcher,
            changes,
            report: SupervisorReport::default(),
        }
    }

    pub fn report(&self) -> &SupervisorReport {
        &self.report
    }

    /// Apply one notification; `true` if it finished an agent
    pub fn observe(&mut self, change: &StateChangeNotification) -> bool {
        self.report.observed += 1;
        debug!(
            "{} {}: {} -> {}",
            change.agent_type, change.agent_id, change.from_state, change.to_state
        );

        if !is_terminal_state(change.agent_type, &change.to_state) {
            return false;
        }

        if change.to_state == "ERROR" {
            warn!("{} {} ended in ERROR", change.agent_type, change.agent_id);
        } else {
            info!("{} {} finished", change.agent_type, change.agent_id);
        }
        self.dispatcher.detach(&change.agent_id);
        self.report.finished.push(FinishedAgent {
            agent_id: change.agent_id.clone(),
            agent_type: change.agent_type,
            final_state: change.to_state.clone(),
        });
        true
    }

    /// Supervise until the dispatcher stops or `cancel` fires
    pub async fn run(&mut self, cancel: &CancellationToken) -> SupervisorReport {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.changes.recv() => next,
            };
            match next {
                Some(change) => {
                    self.observe(&change);
                }
                None => break,
            }
        }
        self.finish()
    }

    /// Supervise until `count` agents have finished
    pub async fn run_until(
        &mut self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<SupervisorReport> {
        while self.report.finished.len() < count {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TroupeError::Canceled),
                next = self.changes.recv() => next,
            };
            let Some(change) = next else {
                return Err(TroupeError::DispatchClosed);
            };
            self.observe(&change);
        }
        Ok(self.finish())
    }

    fn finish(&mut self) -> SupervisorReport {
        self.report.dropped = self.changes.dropped();
        if self.report.dropped > 0 {
            warn!("{} state notifications were dropped", self.report.dropped);
        }
        self.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::Mailbox;
    use chrono::Utc;
    use troupe_core::DispatcherConfig;

    fn change(agent: &str, agent_type: AgentType, from: &str, to: &str) -> StateChangeNotification {
        StateChangeNotification {
            agent_id: AgentId::new(agent),
            agent_type,
            from_state: from.to_string(),
            to_state: to.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states_per_type() {
        assert!(is_terminal_state(AgentType::Coder, "DONE"));
        assert!(is_terminal_state(AgentType::Coder, "ERROR"));
        assert!(!is_terminal_state(AgentType::Coder, "BUDGET_REVIEW"));
        assert!(!is_terminal_state(AgentType::Coder, "MERGING"));
        assert!(is_terminal_state(AgentType::Architect, "DONE"));
        assert!(!is_terminal_state(AgentType::Architect, "REQUEST"));
    }

    #[tokio::test]
    async fn test_detaches_finished_agents() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), None);
        let mut coder = Mailbox::new("coder-001");
        dispatcher.attach(&mut coder).unwrap();
        let notifier = dispatcher.notifier();
        let mut supervisor = Supervisor::new(dispatcher.clone());

        notifier.publish(change("coder-001", AgentType::Coder, "WAITING", "PLANNING"));
        notifier.publish(change("coder-001", AgentType::Coder, "TESTING", "DONE"));

        let report = supervisor
            .run_until(1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.observed, 2);
        assert_eq!(report.finished[0].final_state, "DONE");
        assert!(!dispatcher.is_attached(&AgentId::new("coder-001")));
        assert!(coder.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_ends_when_dispatcher_stops() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), None);
        let cancel = CancellationToken::new();
        dispatcher.start(&cancel).await.unwrap();

        let mut supervisor = Supervisor::new(dispatcher.clone());
        dispatcher
            .notifier()
            .publish(change("architect", AgentType::Architect, "WAITING", "REQUEST"));
        dispatcher.stop(&cancel).await.unwrap();

        let report = supervisor.run(&cancel).await;
        assert_eq!(report.observed, 1);
        assert!(report.finished.is_empty());
    }

    #[tokio::test]
    async fn test_run_until_canceled() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), None);
        let mut supervisor = Supervisor::new(dispatcher);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = supervisor.run_until(1, &cancel).await.unwrap_err();
        assert!(matches!(err, TroupeError::Canceled));
    }
}
