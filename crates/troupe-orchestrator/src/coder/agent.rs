//! Coder agent driver
//!
//! [`CoderAgent::step`] runs exactly one iteration of the current state:
//! one LLM call in PLANNING/CODING, one architect round-trip in PLAN_REVIEW,
//! QUESTION and BUDGET_REVIEW, and the build/test/review/merge pipeline in
//! TESTING. Budget exhaustion escalates instead of failing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use troupe_agent::{ChatMessage, CompletionRequest, CompletionResponse, LlmClient, ToolCall, ToolSpec};
use troupe_core::{
    AgentId, AgentType, Message, Request, Result, ReviewDecision, ReviewStatus, Story,
    TroupeConfig, TroupeError,
};
use uuid::Uuid;

use super::budget::{Activity, ActivityLog, BudgetCounters};
use super::keys;
use super::states::CoderState;
use super::tools;
use crate::collaborators::{ContainerMode, ContainerRuntime, ContextView, PromptRenderer, Workspace};
use crate::dispatcher::{Agent, AgentChannels, Dispatcher};
use crate::state_machine::{AgentState, StateMachine, StateSnapshot, ERROR_KEY};
use crate::worker::{run_agent, AgentOutcome, AgentWorker};

// Command output kept in context and StateData
const MAX_OUTPUT_CHARS: usize = 4000;
// Each recent-activity entry sent in a budget review
const MAX_ACTIVITY_CHARS: usize = 500;

/// Static settings for one coder
#[derive(Debug, Clone)]
pub struct CoderConfig {
    pub model: String,
    pub architect: AgentId,
    pub max_planning_loops: u32,
    pub max_coding_loops: u32,
    pub recent_activity_window: usize,
    pub target_branch: String,
    pub max_tokens: u64,
}

impl CoderConfig {
    pub fn from_config(config: &TroupeConfig) -> Self {
        Self {
            model: config.agents.coder_model.clone(),
            architect: AgentId::new("architect"),
            max_planning_loops: config.agents.max_planning_loops,
            max_coding_loops: config.agents.max_coding_loops,
            recent_activity_window: config.agents.recent_activity_window,
            target_branch: "main".to_string(),
            max_tokens: 4096,
        }
    }

    pub fn with_architect(mut self, architect: impl Into<AgentId>) -> Self {
        self.architect = architect.into();
        self
    }

    pub fn with_loop_budgets(mut self, planning: u32, coding: u32) -> Self {
        self.max_planning_loops = planning;
        self.max_coding_loops = coding;
        self
    }

    pub fn with_target_branch(mut self, branch: impl Into<String>) -> Self {
        self.target_branch = branch.into();
        self
    }
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self::from_config(&TroupeConfig::default())
    }
}

/// Collaborators the coder calls out to
#[derive(Clone)]
pub struct CoderServices {
    pub llm: Arc<dyn LlmClient>,
    pub prompts: Arc<dyn PromptRenderer>,
    pub container: Arc<dyn ContainerRuntime>,
    pub workspace: Arc<dyn Workspace>,
}

/// Plan produced in PLANNING
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub content: String,
    pub confidence: String,
    pub risks: String,
}

/// Question waiting to be sent from QUESTION
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: String,
    pub context: String,
    pub urgency: String,
}

/// Typed control state of a coder, persisted alongside its snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoderProgress {
    pub story: Option<Story>,
    pub budget: BudgetCounters,
    pub plan: Option<PlanDraft>,
    pub approved_plan: Option<String>,
    /// Work state to resume after QUESTION or BUDGET_REVIEW
    pub origin: Option<CoderState>,
    pub question: Option<PendingQuestion>,
    pub work_summary: Option<String>,
    pub completion_summary: Option<String>,
    pub last_feedback: Option<String>,
    #[serde(default)]
    pub context: Vec<ChatMessage>,
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}

/// One coder working one story
pub struct CoderAgent {
    machine: StateMachine<CoderState>,
    config: CoderConfig,
    services: CoderServices,
    progress: CoderProgress,
    activity: ActivityLog,
    dispatcher: Option<Dispatcher>,
    inbox: Option<mpsc::Receiver<Message>>,
}

impl CoderAgent {
    pub fn new(id: impl Into<AgentId>, config: CoderConfig, services: CoderServices) -> Self {
        let activity = ActivityLog::new(config.recent_activity_window);
        Self {
            machine: StateMachine::new(id.into()),
            config,
            services,
            progress: CoderProgress::default(),
            activity,
            dispatcher: None,
            inbox: None,
        }
    }

    /// Rebuild a coder from a persisted snapshot
    pub fn restore(snapshot: &StateSnapshot, config: CoderConfig, services: CoderServices) -> Result<Self> {
        let machine = StateMachine::restore(snapshot)?;
        let progress = match &snapshot.progress {
            Some(value) => serde_json::from_value(value.clone())?,
            None => CoderProgress::default(),
        };
        let mut agent = Self::new(snapshot.agent_id.clone(), config, services);
        agent.machine = machine;
        agent.progress = progress;
        Ok(agent)
    }

    /// Hand the coder its story; it starts planning on the next step
    pub fn assign(&mut self, story: Story) -> Result<()> {
        if self.machine.current_state() != CoderState::Waiting || self.progress.story.is_some() {
            return Err(TroupeError::Agent(format!(
                "{} already has a story",
                self.machine.agent_id()
            )));
        }
        info!("{} assigned story {}: {}", self.machine.agent_id(), story.id, story.title);
        self.progress.story = Some(story);
        Ok(())
    }

    pub fn state(&self) -> CoderState {
        self.machine.current_state()
    }

    pub fn machine(&self) -> &StateMachine<CoderState> {
        &self.machine
    }

    pub fn progress(&self) -> &CoderProgress {
        &self.progress
    }

    /// Drive the coder to DONE or ERROR
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<AgentOutcome> {
        run_agent(self, None, cancel).await
    }

    /// Advance one iteration of the current state
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TroupeError::Canceled);
        }
        self.drain_inbox();

        match self.machine.current_state() {
            CoderState::Waiting => self.begin(cancel).await,
            CoderState::Planning => self.planning_iteration(cancel).await,
            CoderState::PlanReview => self.request_plan_review(cancel).await,
            CoderState::Coding => self.coding_iteration(cancel).await,
            CoderState::Testing => self.run_tests(cancel).await,
            CoderState::Question => self.request_answer(cancel).await,
            CoderState::BudgetReview => self.request_budget_review(cancel).await,
            CoderState::Done | CoderState::Error => Ok(()),
        }
    }

    fn drain_inbox(&mut self) {
        let Some(inbox) = self.inbox.as_mut() else {
            return;
        };
        while let Ok(message) = inbox.try_recv() {
            debug!(
                "{} ignoring unsolicited {} from {}",
                self.machine.agent_id(),
                message.kind(),
                message.from()
            );
        }
    }

    fn story(&self) -> Result<Story> {
        self.progress
            .story
            .clone()
            .ok_or_else(|| TroupeError::Agent(format!("{} has no story assigned", self.machine.agent_id())))
    }

    /// Transition and switch the container for work states
    ///
    /// The loop budget carries over; see [`CoderAgent::enter_fresh`].
    async fn enter(&mut self, next: CoderState) -> Result<()> {
        self.machine.transition_to(next)?;
        match next {
            CoderState::Planning => {
                self.services.container.switch_mode(ContainerMode::ReadOnly).await?;
            }
            CoderState::Coding => {
                self.services.container.switch_mode(ContainerMode::ReadWrite).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Enter a work state with a fresh loop budget and activity window
    ///
    /// Only story start and architect plan/budget decisions grant a fresh
    /// budget. Every other return to a work state keeps counting.
    async fn enter_fresh(&mut self, next: CoderState) -> Result<()> {
        self.enter(next).await?;
        match next {
            CoderState::Planning => self.progress.budget.reset(self.config.max_planning_loops),
            CoderState::Coding => self.progress.budget.reset(self.config.max_coding_loops),
            _ => return Ok(()),
        }
        self.activity.clear();
        Ok(())
    }

    fn inject_feedback(&mut self, source: &str, feedback: &str) {
        self.progress.last_feedback = Some(feedback.to_string());
        self.machine
            .set_state_data(keys::FEEDBACK, json!({"source": source, "feedback": feedback}));
        self.machine
            .set_state_data(format!("{}_feedback", source), feedback);
        self.progress.context.push(ChatMessage::user(format!(
            "Feedback from {} ({}): {}",
            self.config.architect, source, feedback
        )));
    }

    fn reject(&mut self, source: &str, feedback: &str) -> Result<()> {
        self.progress.last_feedback = Some(feedback.to_string());
        self.machine
            .set_state_data(keys::FEEDBACK, json!({"source": source, "feedback": feedback}));
        self.machine
            .force_error(&format!("{} rejected: {}", source, feedback))?;
        Ok(())
    }

    async fn ask_architect(&mut self, request: Request, cancel: &CancellationToken) -> Result<ReviewDecision> {
        let dispatcher = self
            .dispatcher
            .clone()
            .ok_or(TroupeError::DispatcherNotRunning)?;
        let request_type = request.request_type();
        let message = Message::request(
            self.machine.agent_id().clone(),
            self.config.architect.clone(),
            request,
        );

        let reply = dispatcher.request(message, cancel).await?;
        let decision = reply.decision()?;
        info!(
            "{}: {} answered {}",
            self.machine.agent_id(),
            request_type,
            decision.status
        );
        Ok(decision)
    }

    async fn begin(&mut self, cancel: &CancellationToken) -> Result<()> {
        let story = self.story()?;
        self.enter_fresh(CoderState::Planning).await?;

        let check = self.services.workspace.check_work_done(&story).await?;
        if check.done {
            info!("{}: story {} looks already done", self.machine.agent_id(), story.id);
            self.request_completion(
                "Story requirements are already satisfied",
                &check.evidence,
                "high",
                cancel,
            )
            .await?;
        }
        Ok(())
    }

    async fn call_llm(
        &mut self,
        tools: Vec<ToolSpec>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let state = self.machine.current_state();
        let data = self.machine.state_data();
        let view = ContextView {
            story: self.progress.story.as_ref(),
            messages: &self.progress.context,
            plan: self
                .progress
                .approved_plan
                .as_deref()
                .or(self.progress.plan.as_ref().map(|p| p.content.as_str())),
            budget: self.progress.budget,
        };
        let prompt = self.services.prompts.render(state.as_str(), &data, &view)?;
        let request = CompletionRequest::new(self.config.model.clone(), prompt)
            .with_tools(tools)
            .with_max_tokens(self.config.max_tokens);

        let llm = Arc::clone(&self.services.llm);
        let response = llm.complete(request, cancel).await?;
        if !response.text.trim().is_empty() {
            self.progress
                .context
                .push(ChatMessage::assistant(response.text.clone()));
        }
        Ok(response)
    }

    /// Check the loop budget, then make one LLM call
    ///
    /// `None` means this iteration is over without a response to act on.
    async fn work_iteration(
        &mut self,
        tools: Vec<ToolSpec>,
        cancel: &CancellationToken,
    ) -> Result<Option<CompletionResponse>> {
        if self.progress.budget.exhausted() {
            let current = self.machine.current_state();
            info!(
                "{}: {} budget of {} loops exhausted, escalating",
                self.machine.agent_id(),
                current,
                self.progress.budget.max_loops
            );
            self.progress.origin = Some(current);
            self.machine.transition_to(CoderState::BudgetReview)?;
            return Ok(None);
        }

        self.progress.budget.tick();
        debug!(
            "{}: {} iteration {}/{}",
            self.machine.agent_id(),
            self.machine.current_state(),
            self.progress.budget.loops,
            self.progress.budget.max_loops
        );

        match self.call_llm(tools, cancel).await {
            Ok(response) => {
                if response.tool_calls.is_empty() {
                    self.activity.record(Activity::Idle);
                }
                Ok(Some(response))
            }
            // Rate limits burn an iteration and eventually reach the architect
            Err(e) if e.is_recoverable() => {
                warn!("{}: LLM call deferred: {}", self.machine.agent_id(), e);
                self.progress
                    .context
                    .push(ChatMessage::user(format!("LLM call failed: {}", e)));
                self.activity.record(Activity::Idle);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn planning_iteration(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(response) = self.work_iteration(tools::planning_tools(), cancel).await? else {
            return Ok(());
        };

        for call in response.tool_calls {
            match call.name.as_str() {
                tools::SHELL => self.run_shell(&call).await?,
                tools::SUBMIT_PLAN => {
                    if self.submit_plan(&call).await? {
                        return Ok(());
                    }
                }
                tools::ASK_QUESTION => return self.raise_question(&call).await,
                tools::MARK_COMPLETE => {
                    self.activity.record(Activity::Tool {
                        name: call.name.clone(),
                    });
                    return self
                        .request_completion(
                            call.arg("summary"),
                            call.arg("evidence"),
                            or_default(call.arg("confidence"), "medium"),
                            cancel,
                        )
                        .await;
                }
                other => self.unknown_tool(other),
            }
        }
        Ok(())
    }

    async fn coding_iteration(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(response) = self.work_iteration(tools::coding_tools(), cancel).await? else {
            return Ok(());
        };

        for call in response.tool_calls {
            match call.name.as_str() {
                tools::SHELL => self.run_shell(&call).await?,
                tools::ASK_QUESTION => return self.raise_question(&call).await,
                tools::DONE => {
                    self.activity.record(Activity::Tool {
                        name: call.name.clone(),
                    });
                    self.progress.work_summary = Some(call.arg("summary").to_string());
                    return self.enter(CoderState::Testing).await;
                }
                other => self.unknown_tool(other),
            }
        }
        Ok(())
    }

    fn unknown_tool(&mut self, name: &str) {
        warn!("{}: model called unknown tool {}", self.machine.agent_id(), name);
        self.progress
            .context
            .push(ChatMessage::user(format!("Tool {} is not available in this state", name)));
        self.activity.record(Activity::Tool {
            name: name.to_string(),
        });
    }

    async fn run_shell(&mut self, call: &ToolCall) -> Result<()> {
        let command = call.arg("command").trim().to_string();
        if command.is_empty() {
            self.progress
                .context
                .push(ChatMessage::user("shell needs a non-empty command"));
            self.activity.record(Activity::Idle);
            return Ok(());
        }

        let output = self.services.container.exec(&command).await?;
        let text = clip(&output.combined(), MAX_OUTPUT_CHARS);
        debug!(
            "{}: `{}` exited {}",
            self.machine.agent_id(),
            command,
            output.exit_code
        );

        if self.machine.current_state() == CoderState::Planning {
            let first_line = text.lines().next().unwrap_or_default();
            self.machine.push_state_data(
                keys::EXPLORATION_FINDINGS,
                format!("`{}` (exit {}): {}", command, output.exit_code, first_line),
            );
        }
        self.progress.context.push(ChatMessage::user(format!(
            "$ {}\nexit {}\n{}",
            command, output.exit_code, text
        )));
        self.activity.record(Activity::Command {
            command,
            exit_code: output.exit_code,
            output: text,
        });
        Ok(())
    }

    /// Returns `true` when the plan was accepted for review
    async fn submit_plan(&mut self, call: &ToolCall) -> Result<bool> {
        self.activity.record(Activity::Tool {
            name: call.name.clone(),
        });
        let content = call.arg("plan").trim();
        if content.is_empty() {
            self.progress
                .context
                .push(ChatMessage::user("submit_plan needs a non-empty plan"));
            return Ok(false);
        }

        let plan = PlanDraft {
            content: content.to_string(),
            confidence: or_default(call.arg("confidence"), "medium").to_string(),
            risks: call.arg("risks").to_string(),
        };
        self.machine.set_state_data(keys::PLAN, plan.content.clone());
        self.progress.plan = Some(plan);
        self.enter(CoderState::PlanReview).await?;
        Ok(true)
    }

    async fn raise_question(&mut self, call: &ToolCall) -> Result<()> {
        self.activity.record(Activity::Tool {
            name: call.name.clone(),
        });
        self.progress.question = Some(PendingQuestion {
            question: call.arg("question").to_string(),
            context: call.arg("context").to_string(),
            urgency: or_default(call.arg("urgency"), "medium").to_string(),
        });
        self.progress.origin = Some(self.machine.current_state());
        self.enter(CoderState::Question).await
    }

    async fn request_completion(
        &mut self,
        summary: &str,
        evidence: &str,
        confidence: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let story = self.story()?;
        let decision = self
            .ask_architect(
                Request::Completion {
                    summary: summary.to_string(),
                    evidence: evidence.to_string(),
                    confidence: confidence.to_string(),
                    original_story: story.content,
                },
                cancel,
            )
            .await?;

        match decision.status {
            ReviewStatus::Approved => {
                self.progress.completion_summary = Some(summary.to_string());
                self.machine.transition_to(CoderState::Done)
            }
            ReviewStatus::NeedsChanges => {
                self.inject_feedback("completion", &decision.feedback);
                Ok(())
            }
            ReviewStatus::Rejected => self.reject("completion", &decision.feedback),
        }
    }

    async fn request_plan_review(&mut self, cancel: &CancellationToken) -> Result<()> {
        let plan = self
            .progress
            .plan
            .clone()
            .ok_or_else(|| TroupeError::Protocol("PLAN_REVIEW without a plan".to_string()))?;
        let exploration_summary = match self.machine.state_value(keys::EXPLORATION_FINDINGS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };

        let decision = self
            .ask_architect(
                Request::PlanApproval {
                    content: plan.content.clone(),
                    confidence: plan.confidence.clone(),
                    exploration_summary,
                    risks: plan.risks.clone(),
                    approval_id: Uuid::new_v4().to_string(),
                },
                cancel,
            )
            .await?;

        match decision.status {
            ReviewStatus::Approved => {
                self.machine
                    .set_state_data(keys::APPROVED_PLAN, plan.content.clone());
                self.progress.approved_plan = Some(plan.content);
                self.enter_fresh(CoderState::Coding).await
            }
            ReviewStatus::NeedsChanges => {
                self.inject_feedback("plan_review", &decision.feedback);
                self.enter_fresh(CoderState::Planning).await
            }
            ReviewStatus::Rejected => self.reject("plan_review", &decision.feedback),
        }
    }

    fn origin_state(&self) -> CoderState {
        self.progress
            .origin
            .filter(CoderState::is_work_state)
            .unwrap_or(CoderState::Planning)
    }

    async fn request_answer(&mut self, cancel: &CancellationToken) -> Result<()> {
        let question = self
            .progress
            .question
            .clone()
            .ok_or_else(|| TroupeError::Protocol("QUESTION without a pending question".to_string()))?;
        let origin = self.origin_state();

        let decision = self
            .ask_architect(
                Request::Question {
                    question: question.question.clone(),
                    context: question.context,
                    urgency: question.urgency,
                    origin_state: origin.as_str().to_string(),
                },
                cancel,
            )
            .await?;

        if decision.status == ReviewStatus::Rejected {
            return self.reject("question", &decision.feedback);
        }

        self.machine
            .set_state_data(keys::LAST_ANSWER, decision.feedback.clone());
        self.progress.context.push(ChatMessage::user(format!(
            "Q: {}\nA: {}",
            question.question, decision.feedback
        )));
        self.progress.question = None;
        self.progress.origin = None;
        self.enter(origin).await
    }

    async fn request_budget_review(&mut self, cancel: &CancellationToken) -> Result<()> {
        let origin = self.origin_state();
        let window = self.config.recent_activity_window;
        let start = self.progress.context.len().saturating_sub(window);
        let recent_activity = self.progress.context[start..]
            .iter()
            .map(|m| clip(&m.content, MAX_ACTIVITY_CHARS))
            .collect();

        let request = Request::BudgetReview {
            loops: self.progress.budget.loops,
            max_loops: self.progress.budget.max_loops,
            context_size: self.progress.context.len(),
            recent_activity,
            issue_pattern: self.activity.classify().to_string(),
            origin_state: origin.as_str().to_string(),
            approved_plan: self.progress.approved_plan.clone(),
        };
        let decision = self.ask_architect(request, cancel).await?;

        match decision.status {
            ReviewStatus::Approved => {
                self.progress.origin = None;
                self.enter_fresh(origin).await
            }
            ReviewStatus::NeedsChanges => {
                self.inject_feedback("budget_review", &decision.feedback);
                self.progress.origin = None;
                self.enter_fresh(origin).await
            }
            ReviewStatus::Rejected => self.reject("budget_review", &decision.feedback),
        }
    }

    async fn back_to_coding(&mut self, source: &str, feedback: &str) -> Result<()> {
        self.inject_feedback(source, feedback);
        self.enter(CoderState::Coding).await
    }

    /// A failed build or test pass costs one CODING iteration
    async fn failed_check(&mut self, stage: &str, exit_code: i32, output: &str) -> Result<()> {
        self.progress.budget.tick();
        self.activity.record(Activity::CheckFailed {
            stage: stage.to_string(),
            exit_code,
        });
        info!(
            "{}: {} failed ({}/{} loops), back to coding",
            self.machine.agent_id(),
            stage,
            self.progress.budget.loops,
            self.progress.budget.max_loops
        );
        self.back_to_coding(stage, output).await
    }

    async fn run_tests(&mut self, cancel: &CancellationToken) -> Result<()> {
        let container = Arc::clone(&self.services.container);

        let build = container.build().await?;
        if !build.success() {
            let output = clip(&build.combined(), MAX_OUTPUT_CHARS);
            return self.failed_check("build", build.exit_code, &output).await;
        }

        let test = container.test().await?;
        let test_output = clip(&test.combined(), MAX_OUTPUT_CHARS);
        self.machine
            .set_state_data(keys::TEST_OUTPUT, test_output.clone());
        if !test.success() {
            return self.failed_check("tests", test.exit_code, &test_output).await;
        }

        let story = self.story()?;
        let summary = self.progress.work_summary.clone().unwrap_or_default();
        let review = self
            .ask_architect(
                Request::CodeReview {
                    content: format!("{}\n\nTest output:\n{}", summary, test_output),
                    story_id: story.id.clone(),
                    story_type: story.story_type,
                },
                cancel,
            )
            .await?;
        match review.status {
            ReviewStatus::Approved => {}
            ReviewStatus::NeedsChanges => {
                return self.back_to_coding("code_review", &review.feedback).await
            }
            ReviewStatus::Rejected => return self.reject("code_review", &review.feedback),
        }

        let workspace = Arc::clone(&self.services.workspace);
        let commit = workspace
            .commit_artifacts(&story, &format!("{}: {}", story.id, story.title))
            .await?;
        self.machine.set_state_data(keys::COMMIT, commit);

        let merge = self
            .ask_architect(
                Request::Merge {
                    branch: story.branch_name(),
                    target_branch: self.config.target_branch.clone(),
                },
                cancel,
            )
            .await?;
        match merge.status {
            ReviewStatus::Approved => {
                self.progress.completion_summary = Some(summary);
                self.machine.transition_to(CoderState::Done)
            }
            ReviewStatus::NeedsChanges => self.back_to_coding("merge", &merge.feedback).await,
            ReviewStatus::Rejected => self.reject("merge", &merge.feedback),
        }
    }
}

impl Agent for CoderAgent {
    fn id(&self) -> &AgentId {
        self.machine.agent_id()
    }

    fn agent_type(&self) -> AgentType {
        AgentType::Coder
    }

    fn connect(&mut self, channels: AgentChannels) {
        self.machine.attach_notifier(channels.notifier);
        self.dispatcher = Some(channels.dispatcher);
        self.inbox = Some(channels.inbox);
    }
}

#[async_trait]
impl AgentWorker for CoderAgent {
    async fn step(&mut self, cancel: &CancellationToken) -> Result<()> {
        CoderAgent::step(self, cancel).await
    }

    fn is_finished(&self) -> bool {
        self.machine.is_terminal()
    }

    fn fail(&mut self, cause: &str) -> Result<bool> {
        self.machine.force_error(cause)
    }

    fn snapshot(&self) -> StateSnapshot {
        self.machine
            .snapshot(serde_json::to_value(&self.progress).ok())
    }

    fn outcome(&self) -> AgentOutcome {
        AgentOutcome {
            agent_id: self.machine.agent_id().clone(),
            agent_type: AgentType::Coder,
            final_state: self.machine.current_state().as_str().to_string(),
            summary: self.progress.completion_summary.clone(),
            cause: self
                .machine
                .state_value(ERROR_KEY)
                .and_then(|v| v.as_str().map(String::from)),
        }
    }
}
