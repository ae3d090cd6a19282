//! Generation session identity and state machine.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Identifier of one generation session. Safe to use as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh id: `<yyyymmdd>-<hhmmss>-<8 hex>`, sortable by start time.
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session ids arrive from the command line and name files on disk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id '{0}': use letters, digits, '-' or '_'")]
pub struct InvalidSessionId(pub String);

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= 64
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidSessionId(s.to_string()))
        }
    }
}

/// Which phase of the two-phase workflow a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Sample,
    Production,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sample => write!(f, "sample"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Discovering,
    GeneratingPrompts,
    GeneratingImages,
    /// Sample sessions stop here until approved
    AwaitingApproval,
    /// Production sessions pass through here between waves
    Producing,
    Completed,
    Aborted,
}

impl PipelineState {
    /// Whether the session has stopped running.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::Completed | Self::Aborted)
    }

    /// Legal transitions of the state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::{
            Aborted, AwaitingApproval, Completed, Discovering, GeneratingImages,
            GeneratingPrompts, Producing,
        };
        match (self, next) {
            (_, Aborted) => !matches!(self, Completed | Aborted),
            (Discovering, GeneratingPrompts | Producing | AwaitingApproval | Completed) => true,
            (Producing, GeneratingPrompts | Completed) => true,
            (GeneratingPrompts, GeneratingImages) => true,
            (GeneratingImages, GeneratingPrompts | Producing | AwaitingApproval | Completed) => true,
            (AwaitingApproval, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "DISCOVERING",
            Self::GeneratingPrompts => "GENERATING_PROMPTS",
            Self::GeneratingImages => "GENERATING_IMAGES",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Producing => "PRODUCING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Why a session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    BudgetExhausted,
    Cancelled,
    Persistence,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted => write!(f, "budget exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Persistence => write!(f, "unrecoverable persistence error"),
        }
    }
}
