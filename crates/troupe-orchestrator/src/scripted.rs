//! Deterministic in-memory collaborators
//!
//! Scripted stand-ins for the LLM, container, workspace and reviewer seams.
//! Used by the test suites and by `troupe simulate` to drive a full story
//! without network or git access. Every double is `Clone` and shares its
//! script, so a test can keep a handle to inspect what the agent did.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use troupe_agent::{CompletionRequest, CompletionResponse, LlmClient, ToolCall, Usage};
use troupe_core::{
    AgentId, AgentType, Message, Request, RequestType, Result, ReviewDecision, Story, TroupeError,
};

use crate::architect::Reviewer;
use crate::collaborators::{ContainerMode, ContainerRuntime, ExecOutput, WorkCheck, Workspace};
use crate::dispatcher::{Agent, AgentChannels};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a tool call from string arguments
pub fn tool(name: &str, args: &[(&str, &str)]) -> ToolCall {
    let input: Map<String, Value> = args
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    ToolCall::new(name, input)
}

#[derive(Debug, Clone)]
enum LlmStep {
    Respond(CompletionResponse),
    Fail(String),
    RateLimited(String),
}

#[derive(Debug, Default)]
struct LlmScript {
    steps: VecDeque<LlmStep>,
    requests: Vec<CompletionRequest>,
}

/// LLM that replays a fixed script of responses
///
/// Once the script runs out every call answers with empty text and no tool
/// calls, which an agent treats as an idle iteration.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<LlmScript>>,
    usage_per_call: Usage,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage reported with every response
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage_per_call = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn then_response(self, response: CompletionResponse) -> Self {
        self.push(LlmStep::Respond(response));
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.then_response(CompletionResponse::text(text))
    }

    pub fn then_tool(self, call: ToolCall) -> Self {
        self.then_response(CompletionResponse::default().with_tool_call(call))
    }

    /// `n` responses without tool calls
    pub fn then_idle(self, n: usize) -> Self {
        for _ in 0..n {
            self.push(LlmStep::Respond(CompletionResponse::default()));
        }
        self
    }

    /// A non-recoverable provider failure
    pub fn then_error(self, message: &str) -> Self {
        self.push(LlmStep::Fail(message.to_string()));
        self
    }

    /// A recoverable 429-style failure
    pub fn then_rate_limited(self, message: &str) -> Self {
        self.push(LlmStep::RateLimited(message.to_string()));
        self
    }

    /// Append a step to a script that is already shared with an agent
    pub fn push_tool(&self, call: ToolCall) {
        self.push(LlmStep::Respond(CompletionResponse::default().with_tool_call(call)));
    }

    fn push(&self, step: LlmStep) {
        lock(&self.script).steps.push_back(step);
    }

    /// Number of completed calls
    pub fn calls(&self) -> usize {
        lock(&self.script).requests.len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).steps.len()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.script).requests.clone()
    }

    /// Text of the last user message of every request
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.script)
            .requests
            .iter()
            .filter_map(|r| r.messages.last().map(|m| m.content.clone()))
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        if cancel.is_cancelled() {
            return Err(TroupeError::Canceled);
        }
        let step = {
            let mut script = lock(&self.script);
            script.requests.push(request);
            script.steps.pop_front()
        };
        match step {
            Some(LlmStep::Respond(response)) => Ok(response.with_usage(self.usage_per_call)),
            Some(LlmStep::Fail(message)) => Err(TroupeError::Llm(message)),
            Some(LlmStep::RateLimited(message)) => Err(TroupeError::ApiLimit(message)),
            None => Ok(CompletionResponse::default().with_usage(self.usage_per_call)),
        }
    }
}

#[derive(Debug, Default)]
struct ContainerScript {
    exec: VecDeque<ExecOutput>,
    builds: VecDeque<ExecOutput>,
    tests: VecDeque<ExecOutput>,
    commands: Vec<String>,
    modes: Vec<ContainerMode>,
    build_runs: usize,
    test_runs: usize,
}

/// Container whose commands succeed unless told otherwise
#[derive(Debug, Clone, Default)]
pub struct InMemoryContainer {
    script: Arc<Mutex<ContainerScript>>,
}

impl InMemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_exec(self, output: ExecOutput) -> Self {
        lock(&self.script).exec.push_back(output);
        self
    }

    pub fn then_build(self, output: ExecOutput) -> Self {
        lock(&self.script).builds.push_back(output);
        self
    }

    pub fn then_test(self, output: ExecOutput) -> Self {
        lock(&self.script).tests.push_back(output);
        self
    }

    /// Shell commands run so far
    pub fn commands(&self) -> Vec<String> {
        lock(&self.script).commands.clone()
    }

    /// Every mode switch, in order
    pub fn modes(&self) -> Vec<ContainerMode> {
        lock(&self.script).modes.clone()
    }

    pub fn build_runs(&self) -> usize {
        lock(&self.script).build_runs
    }

    pub fn test_runs(&self) -> usize {
        lock(&self.script).test_runs
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryContainer {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut script = lock(&self.script);
        script.commands.push(command.to_string());
        Ok(script.exec.pop_front().unwrap_or_default())
    }

    async fn build(&self) -> Result<ExecOutput> {
        let mut script = lock(&self.script);
        script.build_runs += 1;
        Ok(script.builds.pop_front().unwrap_or_else(|| ExecOutput::ok("build ok")))
    }

    async fn test(&self) -> Result<ExecOutput> {
        let mut script = lock(&self.script);
        script.test_runs += 1;
        Ok(script.tests.pop_front().unwrap_or_else(|| ExecOutput::ok("tests ok")))
    }

    async fn switch_mode(&self, mode: ContainerMode) -> Result<()> {
        lock(&self.script).modes.push(mode);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WorkspaceState {
    done: Option<String>,
    merge_failure: Option<String>,
    commits: Vec<(String, String)>,
    merges: Vec<(String, String)>,
}

/// Workspace that records commits and merges instead of touching git
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkspace {
    state: Arc<Mutex<WorkspaceState>>,
}

impl InMemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every story as already implemented
    pub fn already_done(self, evidence: &str) -> Self {
        lock(&self.state).done = Some(evidence.to_string());
        self
    }

    /// Make every merge fail with `reason`
    pub fn fail_merges(&self, reason: &str) {
        lock(&self.state).merge_failure = Some(reason.to_string());
    }

    pub fn allow_merges(&self) {
        lock(&self.state).merge_failure = None;
    }

    /// `(story id, commit message)` per commit
    pub fn commits(&self) -> Vec<(String, String)> {
        lock(&self.state).commits.clone()
    }

    /// `(branch, target)` per successful merge
    pub fn merges(&self) -> Vec<(String, String)> {
        lock(&self.state).merges.clone()
    }
}

#[async_trait]
impl Workspace for InMemoryWorkspace {
    async fn check_work_done(&self, _story: &Story) -> Result<WorkCheck> {
        let state = lock(&self.state);
        Ok(match &state.done {
            Some(evidence) => WorkCheck {
                done: true,
                evidence: evidence.clone(),
            },
            None => WorkCheck::default(),
        })
    }

    async fn commit_artifacts(&self, story: &Story, message: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.commits.push((story.id.clone(), message.to_string()));
        Ok(format!("commit-{}", state.commits.len()))
    }

    async fn merge_branch(&self, branch: &str, target_branch: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.merge_failure {
            return Err(TroupeError::Workspace(reason.clone()));
        }
        state
            .merges
            .push((branch.to_string(), target_branch.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReviewScript {
    decisions: HashMap<RequestType, VecDeque<ReviewDecision>>,
    failures: VecDeque<String>,
    reviewed: Vec<Request>,
}

/// Reviewer with per-request-type decision queues
///
/// Request types with nothing queued are approved.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReviewer {
    script: Arc<Mutex<ReviewScript>>,
}

impl ScriptedReviewer {
    pub fn approve_all() -> Self {
        Self::default()
    }

    /// Queue the next decision for `request_type`
    pub fn then(self, request_type: RequestType, decision: ReviewDecision) -> Self {
        self.push(request_type, decision);
        self
    }

    /// Make the next review fail, whatever its type
    pub fn fail_next(self, message: &str) -> Self {
        lock(&self.script).failures.push_back(message.to_string());
        self
    }

    /// Queue a decision on a reviewer already handed to an architect
    pub fn push(&self, request_type: RequestType, decision: ReviewDecision) {
        lock(&self.script)
            .decisions
            .entry(request_type)
            .or_default()
            .push_back(decision);
    }

    /// Request types reviewed so far, in order
    pub fn reviewed(&self) -> Vec<RequestType> {
        lock(&self.script)
            .reviewed
            .iter()
            .map(Request::request_type)
            .collect()
    }

    /// Every request reviewed so far, in order
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.script).reviewed.clone()
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(
        &self,
        request: &Request,
        _from: &AgentId,
        _cancel: &CancellationToken,
    ) -> Result<ReviewDecision> {
        let mut script = lock(&self.script);
        let request_type = request.request_type();
        script.reviewed.push(request.clone());
        if let Some(message) = script.failures.pop_front() {
            return Err(TroupeError::Llm(message));
        }
        let queued = script
            .decisions
            .get_mut(&request_type)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or_else(|| ReviewDecision::approved("")))
    }
}

/// Agent that only collects what is delivered to it
pub struct Mailbox {
    id: AgentId,
    agent_type: AgentType,
    inbox: Option<mpsc::Receiver<Message>>,
}

impl Mailbox {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            agent_type: AgentType::Coder,
            inbox: None,
        }
    }

    pub fn with_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = agent_type;
        self
    }

    /// Next delivered message; `None` once detached or never attached
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.as_mut()?.recv().await
    }
}

impl Agent for Mailbox {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn connect(&mut self, channels: AgentChannels) {
        self.inbox = Some(channels.inbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_llm_replays_then_idles() {
        let llm = ScriptedLlm::new()
            .with_usage(10, 5)
            .then_tool(tool("shell", &[("command", "ls")]))
            .then_rate_limited("slow down");
        let cancel = CancellationToken::new();

        let first = llm
            .complete(CompletionRequest::new("m", "one"), &cancel)
            .await
            .unwrap();
        assert_eq!(first.tool_calls[0].arg("command"), "ls");
        assert_eq!(first.usage.total(), 15);

        let err = llm
            .complete(CompletionRequest::new("m", "two"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        let idle = llm
            .complete(CompletionRequest::new("m", "three"), &cancel)
            .await
            .unwrap();
        assert!(idle.tool_calls.is_empty());
        assert_eq!(llm.prompts(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_reviewer_queues_per_type() {
        let reviewer = ScriptedReviewer::approve_all()
            .then(RequestType::Merge, ReviewDecision::rejected("conflicts"));
        let cancel = CancellationToken::new();
        let from = AgentId::new("coder-001");
        let merge = Request::Merge {
            branch: "story-1".to_string(),
            target_branch: "main".to_string(),
        };

        let first = reviewer.review(&merge, &from, &cancel).await.unwrap();
        assert_eq!(first, ReviewDecision::rejected("conflicts"));
        let second = reviewer.review(&merge, &from, &cancel).await.unwrap();
        assert!(second.is_approved());
        assert_eq!(reviewer.reviewed(), vec![RequestType::Merge, RequestType::Merge]);
    }

    #[tokio::test]
    async fn test_workspace_records() {
        let workspace = InMemoryWorkspace::new();
        let story = Story::new("7", "Add health check", "GET /health returns 200");
        let id = workspace.commit_artifacts(&story, "feat: health").await.unwrap();
        assert_eq!(id, "commit-1");

        workspace.fail_merges("conflict");
        assert!(workspace.merge_branch("story-7", "main").await.is_err());
        assert!(workspace.merges().is_empty());
    }
}
