//! Architect agent and the review contract
//!
//! The architect answers every REQUEST with a RESULT carrying one
//! [`ReviewDecision`]. How decisions are made is behind [`Reviewer`]; merges
//! additionally go through [`Workspace::merge_branch`] once approved.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use troupe_agent::{CompletionRequest, LlmClient};
use troupe_core::{
    AgentId, AgentType, Message, MessageKind, Request, Result, ReviewDecision, ReviewStatus,
    TroupeError,
};

use crate::collaborators::Workspace;
use crate::dispatcher::{Agent, AgentChannels, Dispatcher};
use crate::state_machine::{AgentState, StateMachine, StateSnapshot, ERROR_KEY};
use crate::worker::{AgentOutcome, AgentWorker};

/// States of the architect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchitectState {
    /// Idle, waiting for requests
    Waiting,
    /// Reviewing a request
    Request,
    /// Merging an approved branch
    Merging,
    Done,
    Error,
}

impl AgentState for ArchitectState {
    const AGENT_TYPE: AgentType = AgentType::Architect;

    fn initial() -> Self {
        Self::Waiting
    }

    fn error() -> Self {
        Self::Error
    }

    fn all() -> &'static [Self] {
        &[
            Self::Waiting,
            Self::Request,
            Self::Merging,
            Self::Done,
            Self::Error,
        ]
    }

    fn successors(&self) -> &'static [Self] {
        match self {
            Self::Waiting => &[Self::Request, Self::Done, Self::Error],
            Self::Request => &[Self::Waiting, Self::Merging, Self::Error],
            Self::Merging => &[Self::Waiting, Self::Error],
            Self::Done | Self::Error => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Request => "REQUEST",
            Self::Merging => "MERGING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ArchitectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Makes the three-way decision for any request kind
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        request: &Request,
        from: &AgentId,
        cancel: &CancellationToken,
    ) -> Result<ReviewDecision>;
}

/// Reviewer that asks an LLM and reads the leading status word
pub struct LlmReviewer {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u64,
}

impl LlmReviewer {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens: 2048,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Prompt asking the architect model to decide on `request`
pub fn review_prompt(request: &Request, from: &AgentId) -> String {
    let body = match request {
        Request::PlanApproval {
            content,
            confidence,
            exploration_summary,
            risks,
            ..
        } => format!(
            "Review this implementation plan (confidence: {}).\n\nPlan:\n{}\n\nExploration:\n{}\n\nRisks:\n{}",
            confidence, content, exploration_summary, risks
        ),
        Request::Question {
            question, context, ..
        } => format!(
            "Answer this question. Reply APPROVED followed by the answer.\n\nQuestion: {}\n\nContext:\n{}",
            question, context
        ),
        Request::BudgetReview {
            loops,
            max_loops,
            recent_activity,
            issue_pattern,
            origin_state,
            ..
        } => format!(
            "The agent used {}/{} iterations in {} without converging (pattern: {}).\n\
             APPROVED lets it continue, NEEDS_CHANGES redirects it with your guidance, \
             REJECTED abandons the story.\n\nRecent activity:\n{}",
            loops,
            max_loops,
            origin_state,
            issue_pattern,
            recent_activity.join("\n")
        ),
        Request::CodeReview {
            content,
            story_id,
            story_type,
        } => format!(
            "Review the finished {} story {}.\n\n{}",
            story_type, story_id, content
        ),
        Request::Completion {
            summary,
            evidence,
            original_story,
            ..
        } => format!(
            "The agent claims this story is already done.\n\nStory:\n{}\n\nSummary: {}\n\nEvidence:\n{}",
            original_story, summary, evidence
        ),
        Request::Merge {
            branch,
            target_branch,
        } => format!("Approve merging {} into {}?", branch, target_branch),
    };

    format!(
        "You are the architect reviewing a {} request from {}.\n\
         Start your answer with APPROVED, NEEDS_CHANGES or REJECTED, then give feedback.\n\n{}",
        request.request_type(),
        from,
        body
    )
}

/// Read the decision from a free-form answer
///
/// Anything without a recognizable leading status is treated as
/// NEEDS_CHANGES with the whole answer as feedback.
pub fn parse_decision(answer: &str) -> ReviewDecision {
    let trimmed = answer.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '_' || c == '*' || c == '#'))
        .unwrap_or(trimmed.len());
    let word = trimmed[..split].trim_matches(|c: char| c == '*' || c == '#');

    match word.parse::<ReviewStatus>() {
        Ok(status) => {
            let feedback = trimmed[split..]
                .trim_start_matches(|c: char| c == ':' || c == '-' || c == '*' || c.is_whitespace());
            ReviewDecision::new(status, feedback.trim_end())
        }
        Err(_) => ReviewDecision::needs_changes(trimmed),
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    async fn review(
        &self,
        request: &Request,
        from: &AgentId,
        cancel: &CancellationToken,
    ) -> Result<ReviewDecision> {
        let completion = CompletionRequest::new(self.model.clone(), review_prompt(request, from))
            .with_max_tokens(self.max_tokens);
        let response = self.llm.complete(completion, cancel).await?;
        Ok(parse_decision(&response.text))
    }
}

/// Process-scoped reviewer agent
pub struct ArchitectAgent {
    machine: StateMachine<ArchitectState>,
    reviewer: Arc<dyn Reviewer>,
    workspace: Option<Arc<dyn Workspace>>,
    dispatcher: Option<Dispatcher>,
    inbox: Option<mpsc::Receiver<Message>>,
    handled: u64,
}

impl ArchitectAgent {
    pub fn new(id: impl Into<AgentId>, reviewer: Arc<dyn Reviewer>) -> Self {
        Self {
            machine: StateMachine::new(id.into()),
            reviewer,
            workspace: None,
            dispatcher: None,
            inbox: None,
            handled: 0,
        }
    }

    /// Workspace used to carry out approved merges
    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn state(&self) -> ArchitectState {
        self.machine.current_state()
    }

    /// Requests answered so far
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Review one REQUEST and send back its RESULT
    pub async fn handle(&mut self, message: Message, cancel: &CancellationToken) -> Result<()> {
        if message.kind() != MessageKind::Request {
            warn!(
                "{} ignoring {} from {}",
                self.machine.agent_id(),
                message.kind(),
                message.from()
            );
            return Ok(());
        }

        self.machine.transition_to(ArchitectState::Request)?;
        let decision = match message.parse_request() {
            Ok(request) => self.decide(&request, message.from(), cancel).await?,
            Err(e) => ReviewDecision::rejected(format!("Malformed request: {}", e)),
        };
        if self.machine.current_state() != ArchitectState::Waiting {
            self.machine.transition_to(ArchitectState::Waiting)?;
        }

        let dispatcher = self
            .dispatcher
            .clone()
            .ok_or(TroupeError::DispatcherNotRunning)?;
        let reply = Message::result(&message, &decision);
        self.handled += 1;
        match dispatcher.dispatch_message(reply) {
            Ok(()) => Ok(()),
            // The requester finished or was detached while we reviewed
            Err(TroupeError::UnknownRecipient(id)) => {
                warn!("{} dropping reply to detached {}", self.machine.agent_id(), id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn decide(
        &mut self,
        request: &Request,
        from: &AgentId,
        cancel: &CancellationToken,
    ) -> Result<ReviewDecision> {
        let reviewer = Arc::clone(&self.reviewer);
        let decision = match reviewer.review(request, from, cancel).await {
            Ok(decision) => decision,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!("{} review failed: {}", self.machine.agent_id(), e);
                ReviewDecision::needs_changes(format!("Review failed: {}", e))
            }
        };
        info!(
            "{}: {} from {} -> {}",
            self.machine.agent_id(),
            request.request_type(),
            from,
            decision.status
        );

        let Request::Merge {
            branch,
            target_branch,
        } = request
        else {
            return Ok(decision);
        };
        if !decision.is_approved() {
            return Ok(decision);
        }
        let Some(workspace) = self.workspace.clone() else {
            debug!("No workspace configured, merge of {} left to caller", branch);
            return Ok(decision);
        };

        self.machine.transition_to(ArchitectState::Merging)?;
        let merged = workspace.merge_branch(branch, target_branch).await;
        self.machine.transition_to(ArchitectState::Waiting)?;
        match merged {
            Ok(()) => {
                info!("Merged {} into {}", branch, target_branch);
                Ok(decision)
            }
            Err(e) => Ok(ReviewDecision::needs_changes(format!(
                "Merge of {} into {} failed: {}",
                branch, target_branch, e
            ))),
        }
    }
}

impl Agent for ArchitectAgent {
    fn id(&self) -> &AgentId {
        self.machine.agent_id()
    }

    fn agent_type(&self) -> AgentType {
        AgentType::Architect
    }

    fn connect(&mut self, channels: AgentChannels) {
        self.machine.attach_notifier(channels.notifier);
        self.dispatcher = Some(channels.dispatcher);
        self.inbox = Some(channels.inbox);
    }
}

#[async_trait]
impl AgentWorker for ArchitectAgent {
    /// Wait for one message; DONE once the inbox closes
    async fn step(&mut self, cancel: &CancellationToken) -> Result<()> {
        let inbox = self.inbox.as_mut().ok_or(TroupeError::DispatcherNotRunning)?;
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TroupeError::Canceled),
            next = inbox.recv() => next,
        };

        match next {
            Some(message) => self.handle(message, cancel).await,
            None => {
                info!("{} inbox closed after {} requests", self.machine.agent_id(), self.handled);
                self.machine.transition_to(ArchitectState::Done)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.machine.is_terminal()
    }

    fn fail(&mut self, cause: &str) -> Result<bool> {
        self.machine.force_error(cause)
    }

    fn snapshot(&self) -> StateSnapshot {
        self.machine
            .snapshot(Some(serde_json::json!({ "handled": self.handled })))
    }

    fn outcome(&self) -> AgentOutcome {
        AgentOutcome {
            agent_id: self.machine.agent_id().clone(),
            agent_type: AgentType::Architect,
            final_state: self.machine.current_state().as_str().to_string(),
            summary: Some(format!("{} requests handled", self.handled)),
            cause: self
                .machine
                .state_value(ERROR_KEY)
                .and_then(|v| v.as_str().map(String::from)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{InMemoryWorkspace, ScriptedLlm, ScriptedReviewer};
    use troupe_core::{DispatcherConfig, RequestType};

    const LEGAL: &[(ArchitectState, ArchitectState)] = &[
        (ArchitectState::Waiting, ArchitectState::Request),
        (ArchitectState::Waiting, ArchitectState::Done),
        (ArchitectState::Request, ArchitectState::Waiting),
        (ArchitectState::Request, ArchitectState::Merging),
        (ArchitectState::Merging, ArchitectState::Waiting),
    ];

    #[test]
    fn test_every_pair_against_table() {
        for &from in ArchitectState::all() {
            for &to in ArchitectState::all() {
                let mut snapshot =
                    StateMachine::<ArchitectState>::new(AgentId::new("architect")).snapshot(None);
                snapshot.state = from.as_str().to_string();
                let mut sm = StateMachine::<ArchitectState>::restore(&snapshot).unwrap();

                let legal = LEGAL.contains(&(from, to))
                    || (to == ArchitectState::Error && !from.is_terminal());
                assert_eq!(sm.transition_to(to).is_ok(), legal, "{} -> {}", from, to);
                assert_eq!(sm.current_state(), if legal { to } else { from });
            }
        }
    }

    #[test]
    fn test_parse_decision() {
        let d = parse_decision("APPROVED: looks good");
        assert_eq!(d.status, ReviewStatus::Approved);
        assert_eq!(d.feedback, "looks good");

        let d = parse_decision("**NEEDS_CHANGES** - add tests\nfor the parser");
        assert_eq!(d.status, ReviewStatus::NeedsChanges);
        assert_eq!(d.feedback, "add tests\nfor the parser");

        let d = parse_decision("rejected");
        assert_eq!(d.status, ReviewStatus::Rejected);
        assert_eq!(d.feedback, "");

        let d = parse_decision("I am not sure about this plan");
        assert_eq!(d.status, ReviewStatus::NeedsChanges);
        assert_eq!(d.feedback, "I am not sure about this plan");
    }

    #[tokio::test]
    async fn test_llm_reviewer() {
        let llm = ScriptedLlm::new().then_text("REJECTED: wrong approach");
        let reviewer = LlmReviewer::new(Arc::new(llm), "claude-opus-4");
        let request = Request::Merge {
            branch: "story-1".to_string(),
            target_branch: "main".to_string(),
        };
        let decision = reviewer
            .review(&request, &AgentId::new("coder-001"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, ReviewDecision::rejected("wrong approach"));
    }

    #[test]
    fn test_review_prompt_mentions_request() {
        let request = Request::BudgetReview {
            loops: 8,
            max_loops: 8,
            context_size: 20,
            recent_activity: vec!["shell `ls` exited 0".to_string()],
            issue_pattern: "repeated_command".to_string(),
            origin_state: "PLANNING".to_string(),
            approved_plan: None,
        };
        let prompt = review_prompt(&request, &AgentId::new("coder-001"));
        assert!(prompt.contains("budget_review request from coder-001"));
        assert!(prompt.contains("8/8 iterations in PLANNING"));
        assert!(prompt.contains("repeated_command"));
    }

    async fn wired(reviewer: ScriptedReviewer) -> (Dispatcher, ArchitectAgent, InMemoryWorkspace) {
        let workspace = InMemoryWorkspace::new();
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), None);
        let mut architect = ArchitectAgent::new("architect", Arc::new(reviewer))
            .with_workspace(Arc::new(workspace.clone()));
        dispatcher.attach(&mut architect).unwrap();
        dispatcher.start(&CancellationToken::new()).await.unwrap();
        (dispatcher, architect, workspace)
    }

    fn merge_from(coder: &str) -> Message {
        Message::request(
            AgentId::new(coder),
            AgentId::new("architect"),
            Request::Merge {
                branch: "story-7".to_string(),
                target_branch: "main".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_approved_merge_runs_workspace_merge() {
        let (dispatcher, mut architect, workspace) = wired(ScriptedReviewer::approve_all()).await;
        let receiver = dispatcher.state_changes();

        architect
            .handle(merge_from("coder-001"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(workspace.merges(), vec![("story-7".to_string(), "main".to_string())]);
        let states: Vec<_> = receiver.drain().into_iter().map(|n| n.to_state).collect();
        assert_eq!(states, vec!["REQUEST", "MERGING", "WAITING"]);
        assert_eq!(architect.state(), ArchitectState::Waiting);
    }

    #[tokio::test]
    async fn test_failed_merge_needs_changes() {
        let (dispatcher, mut architect, workspace) = wired(ScriptedReviewer::approve_all()).await;
        workspace.fail_merges("conflict in src/lib.rs");
        let mut coder = crate::scripted::Mailbox::new("coder-001");
        dispatcher.attach(&mut coder).unwrap();

        let cancel = CancellationToken::new();
        let ask = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.request(merge_from("coder-001"), &cancel).await })
        };
        architect.step(&cancel).await.unwrap();

        let reply = ask.await.unwrap().unwrap();
        let decision = reply.decision().unwrap();
        assert_eq!(decision.status, ReviewStatus::NeedsChanges);
        assert!(decision.feedback.contains("conflict in src/lib.rs"));
    }

    #[tokio::test]
    async fn test_reviewer_error_becomes_needs_changes() {
        let reviewer = ScriptedReviewer::approve_all().fail_next("model unavailable");
        let (dispatcher, mut architect, _) = wired(reviewer.clone()).await;
        let mut coder = crate::scripted::Mailbox::new("coder-001");
        dispatcher.attach(&mut coder).unwrap();

        let message = Message::request(
            AgentId::new("coder-001"),
            AgentId::new("architect"),
            Request::Question {
                question: "Which crate?".to_string(),
                context: String::new(),
                urgency: "low".to_string(),
                origin_state: "PLANNING".to_string(),
            },
        );
        architect.handle(message, &CancellationToken::new()).await.unwrap();

        let reply = coder.recv().await.unwrap();
        let decision = reply.decision().unwrap();
        assert_eq!(decision.status, ReviewStatus::NeedsChanges);
        assert!(decision.feedback.contains("model unavailable"));
        assert_eq!(reviewer.reviewed(), vec![RequestType::Question]);
    }

    #[tokio::test]
    async fn test_inbox_close_finishes_architect() {
        let (dispatcher, mut architect, _) = wired(ScriptedReviewer::approve_all()).await;
        dispatcher.detach(&AgentId::new("architect"));

        architect.step(&CancellationToken::new()).await.unwrap();
        assert_eq!(architect.state(), ArchitectState::Done);
        assert!(architect.is_finished());
    }
}
