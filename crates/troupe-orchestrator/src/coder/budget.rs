//! Loop budget counters and stuck-loop classification
//!
//! Exhausting the budget is not an error: the coder escalates to the
//! architect with a snapshot of recent activity and a heuristic guess at why
//! it is not converging.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::OnceLock;

/// Loop counter for the current work phase
///
/// Reset when a review hands the coder a fresh phase, not on every
/// CODING entry, so build and test retries spend the same budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounters {
    pub loops: u32,
    pub max_loops: u32,
}

impl BudgetCounters {
    pub fn new(max_loops: u32) -> Self {
        Self {
            loops: 0,
            max_loops,
        }
    }

    /// Whether the next iteration must escalate instead of running
    pub fn exhausted(&self) -> bool {
        self.loops >= self.max_loops
    }

    pub fn tick(&mut self) {
        self.loops += 1;
    }

    pub fn reset(&mut self, max_loops: u32) {
        *self = Self::new(max_loops);
    }
}

/// Heuristic reason a loop is not converging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuePattern {
    /// The same command keeps being run
    RepeatedCommand,
    /// Builds or tests keep failing
    BuildTestFailureLoop,
    /// The model keeps answering without using tools
    NoToolProgress,
    GeneralExploration,
}

impl IssuePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedCommand => "repeated_command",
            Self::BuildTestFailureLoop => "build_test_failure_loop",
            Self::NoToolProgress => "no_tool_progress",
            Self::GeneralExploration => "general_exploration",
        }
    }
}

impl fmt::Display for IssuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration's observable action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Command {
        command: String,
        exit_code: i32,
        output: String,
    },
    Tool {
        name: String,
    },
    /// A build or test run in TESTING that did not pass
    CheckFailed {
        stage: String,
        exit_code: i32,
    },
    /// Iteration that produced text but no tool call
    Idle,
}

impl Activity {
    pub fn summary(&self) -> String {
        match self {
            Activity::Command {
                command, exit_code, ..
            } => format!("shell `{}` exited {}", command, exit_code),
            Activity::Tool { name } => format!("tool {}", name),
            Activity::CheckFailed { stage, exit_code } => {
                format!("{} failed with exit {}", stage, exit_code)
            }
            Activity::Idle => "no tool call".to_string(),
        }
    }
}

// Repeats needed before a command counts as stuck
const REPEAT_THRESHOLD: usize = 3;
// Failures needed before a build/test loop is reported
const FAILURE_THRESHOLD: usize = 2;

fn failure_signature() -> Option<&'static Regex> {
    static SIGNATURE: OnceLock<Option<Regex>> = OnceLock::new();
    SIGNATURE
        .get_or_init(|| {
            Regex::new(
                r"(?im)(error(\[E\d+\])?:|test result: FAILED|FAILED|panicked at|build failed|compilation failed|exit status: [1-9])",
            )
            .ok()
        })
        .as_ref()
}

/// Sliding window of recent activity used for classification
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<Activity>,
    window: usize,
}

impl ActivityLog {
    pub fn new(window: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(window),
            window: window.max(REPEAT_THRESHOLD),
        }
    }

    pub fn record(&mut self, activity: Activity) {
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(activity);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summaries(&self) -> Vec<String> {
        self.entries.iter().map(Activity::summary).collect()
    }

    /// Classify the recent window, most specific pattern first
    pub fn classify(&self) -> IssuePattern {
        if self.has_repeated_command() {
            return IssuePattern::RepeatedCommand;
        }
        if self.failing_commands() >= FAILURE_THRESHOLD {
            return IssuePattern::BuildTestFailureLoop;
        }
        let idle = self
            .entries
            .iter()
            .filter(|a| matches!(a, Activity::Idle))
            .count();
        if idle > 0 && idle * 2 >= self.entries.len() {
            return IssuePattern::NoToolProgress;
        }
        IssuePattern::GeneralExploration
    }

    fn commands(&self) -> impl Iterator<Item = (&str, i32, &str)> {
        self.entries.iter().filter_map(|a| match a {
            Activity::Command {
                command,
                exit_code,
                output,
            } => Some((command.trim(), *exit_code, output.as_str())),
            _ => None,
        })
    }

    fn has_repeated_command(&self) -> bool {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for (command, _, _) in self.commands() {
            match counts.iter_mut().find(|(c, _)| *c == command) {
                Some((_, n)) => *n += 1,
                None => counts.push((command, 1)),
            }
        }
        counts.iter().any(|(_, n)| *n >= REPEAT_THRESHOLD)
    }

    fn failing_commands(&self) -> usize {
        let shell = self
            .commands()
            .filter(|(_, exit_code, output)| {
                *exit_code != 0 && failure_signature().map_or(true, |re| re.is_match(output))
            })
            .count();
        let checks = self
            .entries
            .iter()
            .filter(|a| matches!(a, Activity::CheckFailed { .. }))
            .count();
        shell + checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(cmd: &str, exit_code: i32, output: &str) -> Activity {
        Activity::Command {
            command: cmd.to_string(),
            exit_code,
            output: output.to_string(),
        }
    }

    #[test]
    fn test_counters_exhaust_at_max() {
        let mut budget = BudgetCounters::new(2);
        assert!(!budget.exhausted());
        budget.tick();
        assert!(!budget.exhausted());
        budget.tick();
        assert!(budget.exhausted());
        budget.reset(3);
        assert_eq!(budget, BudgetCounters::new(3));
    }

    #[test]
    fn test_repeated_command() {
        let mut log = ActivityLog::new(5);
        for _ in 0..3 {
            log.record(command("ls src", 0, "main.rs"));
        }
        assert_eq!(log.classify(), IssuePattern::RepeatedCommand);
    }

    #[test]
    fn test_build_failure_loop() {
        let mut log = ActivityLog::new(5);
        log.record(command("cargo build", 101, "error[E0425]: cannot find value `x`"));
        log.record(command("cargo test", 101, "test result: FAILED. 1 passed; 2 failed"));
        assert_eq!(log.classify(), IssuePattern::BuildTestFailureLoop);
    }

    #[test]
    fn test_failed_checks_count_without_signature() {
        let mut log = ActivityLog::new(5);
        log.record(Activity::Tool {
            name: "done".to_string(),
        });
        log.record(Activity::CheckFailed {
            stage: "build".to_string(),
            exit_code: 1,
        });
        assert_eq!(log.classify(), IssuePattern::GeneralExploration);

        log.record(Activity::CheckFailed {
            stage: "tests".to_string(),
            exit_code: 101,
        });
        assert_eq!(log.classify(), IssuePattern::BuildTestFailureLoop);
        assert_eq!(log.summaries()[2], "tests failed with exit 101");
    }

    #[test]
    fn test_failure_without_signature_not_counted() {
        let mut log = ActivityLog::new(5);
        log.record(command("grep foo", 1, ""));
        log.record(command("grep bar", 1, ""));
        assert_eq!(log.classify(), IssuePattern::GeneralExploration);
    }

    #[test]
    fn test_no_tool_progress() {
        let mut log = ActivityLog::new(4);
        log.record(Activity::Idle);
        log.record(Activity::Idle);
        log.record(command("ls", 0, ""));
        assert_eq!(log.classify(), IssuePattern::NoToolProgress);
    }

    #[test]
    fn test_window_evicts_old_entries() {
        let mut log = ActivityLog::new(3);
        for i in 0..5 {
            log.record(command(&format!("cat f{}", i), 0, ""));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.summaries()[0], "shell `cat f2` exited 0");
        assert_eq!(log.classify(), IssuePattern::GeneralExploration);
    }

    #[test]
    fn test_pattern_names() {
        assert_eq!(IssuePattern::BuildTestFailureLoop.to_string(), "build_test_failure_loop");
        assert_eq!(
            serde_json::to_string(&IssuePattern::RepeatedCommand).unwrap(),
            "\"repeated_command\""
        );
    }
}
