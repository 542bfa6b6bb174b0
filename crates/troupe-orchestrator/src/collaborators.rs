//! Collaborator seams consumed by the coder and architect
//!
//! Prompt text, container lifecycle and git/workspace plumbing live outside
//! the coordination runtime. Agents only see these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use troupe_agent::ChatMessage;
use troupe_core::{Result, Story};

use crate::coder::BudgetCounters;
use crate::state_machine::StateData;

/// Read-only view of an agent's working context for prompt rendering
#[derive(Debug, Clone, Copy)]
pub struct ContextView<'a> {
    pub story: Option<&'a Story>,
    pub messages: &'a [ChatMessage],
    pub plan: Option<&'a str>,
    pub budget: BudgetCounters,
}

/// Turns `(state, StateData, context)` into an LLM prompt
pub trait PromptRenderer: Send + Sync {
    fn render(&self, state: &str, data: &StateData, context: &ContextView<'_>) -> Result<String>;
}

/// Plain-text renderer used when no template set is configured
#[derive(Debug, Clone, Default)]
pub struct DefaultPromptRenderer;

// Messages older than this are left out of the prompt
const PROMPT_HISTORY: usize = 20;

impl PromptRenderer for DefaultPromptRenderer {
    fn render(&self, state: &str, data: &StateData, context: &ContextView<'_>) -> Result<String> {
        let mut prompt = String::new();

        prompt.push_str(&format!("# Current state: {}\n", state));
        prompt.push_str(&format!(
            "Iteration {} of {}\n",
            context.budget.loops, context.budget.max_loops
        ));

        if let Some(story) = context.story {
            prompt.push_str(&format!(
                "\n## Story {}: {}\n{}\n",
                story.id, story.title, story.content
            ));
        }

        match state {
            "PLANNING" => prompt.push_str(
                "\nExplore the repository read-only. Submit a plan with submit_plan, \
                 ask the architect with ask_question, or call mark_complete if the \
                 story is already satisfied.\n",
            ),
            "CODING" => prompt.push_str(
                "\nImplement the approved plan. Use shell to edit and build, \
                 ask_question if blocked, and call done when the work is complete.\n",
            ),
            _ => {}
        }

        if let Some(plan) = context.plan {
            prompt.push_str(&format!("\n## Plan\n{}\n", plan));
        }

        if !data.is_empty() {
            prompt.push_str("\n## Working notes\n");
            for (key, value) in data {
                match value.as_str() {
                    Some(text) => prompt.push_str(&format!("- {}: {}\n", key, text)),
                    None => prompt.push_str(&format!("- {}: {}\n", key, value)),
                }
            }
        }

        let start = context.messages.len().saturating_sub(PROMPT_HISTORY);
        if start < context.messages.len() {
            prompt.push_str("\n## Recent activity\n");
            for message in &context.messages[start..] {
                prompt.push_str(&format!("[{:?}] {}\n", message.role, message.content));
            }
        }

        Ok(prompt)
    }
}

/// Container write permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerMode {
    ReadOnly,
    ReadWrite,
}

/// Result of a command run inside the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined for feedback and prompts
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Container lifecycle used from PLANNING, CODING and TESTING
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
    async fn build(&self) -> Result<ExecOutput>;
    async fn test(&self) -> Result<ExecOutput>;
    async fn switch_mode(&self, mode: ContainerMode) -> Result<()>;
}

/// Outcome of checking whether a story is already implemented
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkCheck {
    pub done: bool,
    pub evidence: String,
}

/// Git/workspace operations
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn check_work_done(&self, story: &Story) -> Result<WorkCheck>;

    /// Commit the story's work, returning the commit id
    async fn commit_artifacts(&self, story: &Story, message: &str) -> Result<String>;

    async fn merge_branch(&self, branch: &str, target_branch: &str) -> Result<()>;
}
