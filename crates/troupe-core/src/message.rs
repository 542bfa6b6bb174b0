//! Message envelope and typed payloads for inter-agent communication
//!
//! A [`Message`] is immutable once constructed. REQUEST messages carry a
//! [`Request`] serialized into the payload map (tagged by `request_type`);
//! RESULT messages carry a [`ReviewDecision`] and point back at the request
//! they answer through `reply_to`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, TroupeError};
use crate::types::{AgentId, StoryType};

/// Payload map carried by a message
pub type Payload = Map<String, Value>;

/// The two message kinds exchanged between agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Request,
    Result,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "REQUEST"),
            Self::Result => write!(f, "RESULT"),
        }
    }
}

/// Kinds of approval-style requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    PlanApproval,
    Question,
    BudgetReview,
    CodeReview,
    Completion,
    Merge,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanApproval => write!(f, "plan_approval"),
            Self::Question => write!(f, "question"),
            Self::BudgetReview => write!(f, "budget_review"),
            Self::CodeReview => write!(f, "code_review"),
            Self::Completion => write!(f, "completion"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan_approval" => Ok(Self::PlanApproval),
            "question" => Ok(Self::Question),
            "budget_review" => Ok(Self::BudgetReview),
            "code_review" => Ok(Self::CodeReview),
            "completion" => Ok(Self::Completion),
            "merge" => Ok(Self::Merge),
            _ => Err(format!("Invalid request type: {}", s)),
        }
    }
}

/// Typed request payloads, one variant per request type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum Request {
    PlanApproval {
        content: String,
        confidence: String,
        exploration_summary: String,
        risks: String,
        approval_id: String,
    },
    Question {
        question: String,
        context: String,
        urgency: String,
        origin_state: String,
    },
    BudgetReview {
        loops: u32,
        max_loops: u32,
        context_size: usize,
        recent_activity: Vec<String>,
        issue_pattern: String,
        origin_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved_plan: Option<String>,
    },
    CodeReview {
        content: String,
        story_id: String,
        story_type: StoryType,
    },
    Completion {
        summary: String,
        evidence: String,
        confidence: String,
        original_story: String,
    },
    Merge {
        branch: String,
        target_branch: String,
    },
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::PlanApproval { .. } => RequestType::PlanApproval,
            Self::Question { .. } => RequestType::Question,
            Self::BudgetReview { .. } => RequestType::BudgetReview,
            Self::CodeReview { .. } => RequestType::CodeReview,
            Self::Completion { .. } => RequestType::Completion,
            Self::Merge { .. } => RequestType::Merge,
        }
    }

    fn into_payload(self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // Internally tagged struct variants always serialize to objects
            _ => Payload::new(),
        }
    }
}

/// Three-way outcome shared by every approval-style request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Approved,
    NeedsChanges,
    Rejected,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "APPROVED"),
            Self::NeedsChanges => write!(f, "NEEDS_CHANGES"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "APPROVED" | "APPROVE" => Ok(Self::Approved),
            "NEEDS_CHANGES" | "CHANGES_REQUESTED" => Ok(Self::NeedsChanges),
            "REJECTED" | "REJECT" => Ok(Self::Rejected),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

/// Decision carried by every RESULT message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub status: ReviewStatus,
    #[serde(default)]
    pub feedback: String,
}

impl ReviewDecision {
    pub fn new(status: ReviewStatus, feedback: impl Into<String>) -> Self {
        Self {
            status,
            feedback: feedback.into(),
        }
    }

    pub fn approved(feedback: impl Into<String>) -> Self {
        Self::new(ReviewStatus::Approved, feedback)
    }

    pub fn needs_changes(feedback: impl Into<String>) -> Self {
        Self::new(ReviewStatus::NeedsChanges, feedback)
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self::new(ReviewStatus::Rejected, feedback)
    }

    pub fn is_approved(&self) -> bool {
        self.status == ReviewStatus::Approved
    }
}

/// Immutable unit of inter-agent communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    kind: MessageKind,
    from: AgentId,
    to: AgentId,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from raw parts
    pub fn new(kind: MessageKind, from: AgentId, to: AgentId, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from,
            to,
            payload,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    /// Build a REQUEST carrying a typed payload
    pub fn request(from: impl Into<AgentId>, to: impl Into<AgentId>, request: Request) -> Self {
        Self::new(MessageKind::Request, from.into(), to.into(), request.into_payload())
    }

    /// Build the RESULT answering `request`
    pub fn result(request: &Message, decision: &ReviewDecision) -> Self {
        let payload = match serde_json::to_value(decision) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        };
        let mut message = Self::new(
            MessageKind::Result,
            request.to.clone(),
            request.from.clone(),
            payload,
        );
        message.reply_to = Some(request.id);
        message
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn from(&self) -> &AgentId {
        &self.from
    }

    pub fn to(&self) -> &AgentId {
        &self.to
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn reply_to(&self) -> Option<Uuid> {
        self.reply_to
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// String value of a payload key, if present
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The `request_type` of a REQUEST message
    pub fn request_type(&self) -> Option<RequestType> {
        self.payload_str("request_type")?.parse().ok()
    }

    /// Decode the typed request carried by a REQUEST message
    pub fn parse_request(&self) -> Result<Request> {
        if self.kind != MessageKind::Request {
            return Err(TroupeError::Protocol(format!(
                "Message {} is a {}, not a REQUEST",
                self.id, self.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }

    /// Decode the review decision carried by a RESULT message
    pub fn decision(&self) -> Result<ReviewDecision> {
        if self.kind != MessageKind::Result {
            return Err(TroupeError::Protocol(format!(
                "Message {} is a {}, not a RESULT",
                self.id, self.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }
}
