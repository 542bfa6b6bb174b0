//! Coder states and their edge table

use serde::{Deserialize, Serialize};
use std::fmt;
use troupe_core::AgentType;

use crate::state_machine::AgentState;

/// States of the coder workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoderState {
    /// No story assigned yet
    Waiting,
    /// Read-only exploration until a plan is ready
    Planning,
    /// Plan sent to the architect, awaiting a decision
    PlanReview,
    /// Implementing the approved plan
    Coding,
    /// Build, test, code review and merge
    Testing,
    /// Question sent to the architect
    Question,
    /// Loop budget exhausted, awaiting the architect's call
    BudgetReview,
    Done,
    Error,
}

use CoderState::*;

const ALL: &[CoderState] = &[
    Waiting,
    Planning,
    PlanReview,
    Coding,
    Testing,
    Question,
    BudgetReview,
    Done,
    Error,
];

impl AgentState for CoderState {
    const AGENT_TYPE: AgentType = AgentType::Coder;

    fn initial() -> Self {
        Waiting
    }

    fn error() -> Self {
        Error
    }

    fn all() -> &'static [Self] {
        ALL
    }

    fn successors(&self) -> &'static [Self] {
        match self {
            Waiting => &[Planning, Error],
            Planning => &[PlanReview, Question, BudgetReview, Done, Error],
            PlanReview => &[Coding, Planning, Error],
            Coding => &[Testing, Question, BudgetReview, Error],
            Testing => &[Done, Coding, Error],
            Question => &[Planning, Coding, Error],
            BudgetReview => &[Planning, Coding, Error],
            Done | Error => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Waiting => "WAITING",
            Planning => "PLANNING",
            PlanReview => "PLAN_REVIEW",
            Coding => "CODING",
            Testing => "TESTING",
            Question => "QUESTION",
            BudgetReview => "BUDGET_REVIEW",
            Done => "DONE",
            Error => "ERROR",
        }
    }
}

impl CoderState {
    /// States that run the LLM loop and consume budget
    pub fn is_work_state(&self) -> bool {
        matches!(self, Planning | Coding)
    }
}

impl fmt::Display for CoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StateMachine;
    use troupe_core::{AgentId, TroupeError};

    const LEGAL: &[(CoderState, CoderState)] = &[
        (Waiting, Planning),
        (Planning, PlanReview),
        (Planning, Question),
        (Planning, BudgetReview),
        (Planning, Done),
        (Question, Planning),
        (Question, Coding),
        (PlanReview, Coding),
        (PlanReview, Planning),
        (PlanReview, Error),
        (Coding, Testing),
        (Coding, Question),
        (Coding, BudgetReview),
        (BudgetReview, Planning),
        (BudgetReview, Coding),
        (BudgetReview, Error),
        (Testing, Done),
        (Testing, Coding),
    ];

    fn is_legal(from: CoderState, to: CoderState) -> bool {
        LEGAL.contains(&(from, to)) || (to == Error && !from.is_terminal())
    }

    fn machine_in(state: CoderState) -> StateMachine<CoderState> {
        let mut snapshot = StateMachine::<CoderState>::new(AgentId::coder(1)).snapshot(None);
        snapshot.state = state.as_str().to_string();
        StateMachine::restore(&snapshot).unwrap()
    }

    #[test]
    fn test_every_pair_against_table() {
        for &from in CoderState::all() {
            for &to in CoderState::all() {
                let mut sm = machine_in(from);
                let result = sm.transition_to(to);
                if is_legal(from, to) {
                    assert!(result.is_ok(), "{} -> {} should be legal", from, to);
                    assert_eq!(sm.current_state(), to);
                } else {
                    assert!(
                        matches!(result, Err(TroupeError::InvalidTransition { .. })),
                        "{} -> {} should be rejected",
                        from,
                        to
                    );
                    assert_eq!(sm.current_state(), from);
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = CoderState::all().iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&Done, &Error]);
    }

    #[test]
    fn test_names_round_trip() {
        for &state in CoderState::all() {
            assert_eq!(CoderState::parse(state.as_str()), Some(state));
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert_eq!(CoderState::parse("IDLE"), None);
    }
}
