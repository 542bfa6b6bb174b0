//! Core type definitions for Troupe coordination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of agent participating in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Coder,
    Architect,
    #[serde(rename = "pm")]
    ProductManager,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coder => write!(f, "coder"),
            Self::Architect => write!(f, "architect"),
            Self::ProductManager => write!(f, "pm"),
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coder" => Ok(Self::Coder),
            "architect" => Ok(Self::Architect),
            "pm" | "product_manager" | "product-manager" => Ok(Self::ProductManager),
            _ => Err(format!("Invalid agent type: {}", s)),
        }
    }
}

/// Stable agent identifier (e.g. `coder-001`, `architect`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Numbered coder id, e.g. `coder-003`
    pub fn coder(number: u32) -> Self {
        Self(format!("coder-{:03}", number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::str::FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err("Agent id cannot be empty".to_string());
        }
        Ok(Self::new(s.trim()))
    }
}

/// Emitted once per committed state transition
///
/// States are carried as their canonical upper-case names so observers can
/// consume notifications from every agent type on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeNotification {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub from_state: String,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
}

/// Kind of story a coder works on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryType {
    #[default]
    App,
    Devops,
}

impl std::fmt::Display for StoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App => write!(f, "app"),
            Self::Devops => write!(f, "devops"),
        }
    }
}

/// A unit of work assigned to a coder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub story_type: StoryType,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            story_type: StoryType::App,
        }
    }

    pub fn with_type(mut self, story_type: StoryType) -> Self {
        self.story_type = story_type;
        self
    }

    /// Branch name the coder works on for this story
    pub fn branch_name(&self) -> String {
        format!("story-{}", self.id)
    }
}
