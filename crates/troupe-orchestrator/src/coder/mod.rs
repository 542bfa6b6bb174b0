//! Coder workflow
//!
//! WAITING → PLANNING → PLAN_REVIEW → CODING → TESTING → DONE, with QUESTION
//! and BUDGET_REVIEW detours and ERROR reachable from every non-terminal
//! state. The coder blocks only while awaiting an architect RESULT or a
//! rate-limit permit.

mod agent;
mod budget;
mod states;
pub mod tools;

pub use agent::{CoderAgent, CoderConfig, CoderProgress, CoderServices, PendingQuestion, PlanDraft};
pub use budget::{Activity, ActivityLog, BudgetCounters, IssuePattern};
pub use states::CoderState;

/// StateData keys written by the coder
pub mod keys {
    pub const EXPLORATION_FINDINGS: &str = "exploration_findings";
    pub const PLAN: &str = "plan";
    pub const APPROVED_PLAN: &str = "approved_plan";
    /// Latest feedback as `{source, feedback}`
    pub const FEEDBACK: &str = "feedback";
    pub const BUDGET_REVIEW_FEEDBACK: &str = "budget_review_feedback";
    pub const LAST_ANSWER: &str = "last_answer";
    pub const TEST_OUTPUT: &str = "test_output";
    pub const COMMIT: &str = "commit";
}
