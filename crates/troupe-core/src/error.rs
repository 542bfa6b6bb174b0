//! Unified error types for Troupe

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::types::AgentType;

/// Unified error type for all Troupe operations
#[derive(Error, Debug)]
pub enum TroupeError {
    // State machine errors
    #[error("Invalid {agent_type} transition: {from} -> {to}")]
    InvalidTransition {
        agent_type: AgentType,
        from: String,
        to: String,
    },

    #[error("Unknown {agent_type} state: {state}")]
    UnknownState { agent_type: AgentType, state: String },

    // Routing errors
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Inbox of {0} is full")]
    InboxFull(String),

    #[error("Dispatcher is closed")]
    DispatchClosed,

    #[error("Dispatcher is not running")]
    DispatcherNotRunning,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Rate limiting errors
    #[error("Daily budget exceeded for {model}: spent ${spent:.4} of ${budget:.4}")]
    DailyBudgetExceeded {
        model: String,
        spent: f64,
        budget: f64,
    },

    #[error("Request of {requested} tokens exceeds the {max_tpm} TPM limit of {model}")]
    TokenLimitExceeded {
        model: String,
        requested: u64,
        max_tpm: u64,
    },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Rate limiter is closed")]
    LimiterClosed,

    // Cancellation
    #[error("Operation canceled")]
    Canceled,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    // Collaborator errors
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl TroupeError {
    /// Whether the caller may back off and retry instead of failing the task
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DailyBudgetExceeded { .. } | Self::TokenLimitExceeded { .. } | Self::ApiLimit(_)
        )
    }

    /// Whether this error came from cancellation or a deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded(_))
    }
}

/// Result type alias using TroupeError
pub type Result<T> = std::result::Result<T, TroupeError>;

/// Run `fut` with an optional deadline, mapping expiry to `DeadlineExceeded`
pub async fn with_deadline<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TroupeError::DeadlineExceeded(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = TroupeError::InvalidTransition {
            agent_type: AgentType::Coder,
            from: "WAITING".to_string(),
            to: "DONE".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid coder transition: WAITING -> DONE");
    }

    #[test]
    fn test_recoverable_classification() {
        let budget = TroupeError::DailyBudgetExceeded {
            model: "sonnet".to_string(),
            spent: 1.0,
            budget: 1.0,
        };
        assert!(budget.is_recoverable());
        assert!(!TroupeError::DispatchClosed.is_recoverable());
        assert!(TroupeError::Canceled.is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TroupeError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_with_deadline_none_passes_through() {
        let result = with_deadline(None, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
