use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{AgentId, UserId};

/// Which party currently holds conversational authority for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Assistant,
    Human,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assistant => write!(f, "assistant"),
            Self::Human => write!(f, "human"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // Older clients label the automated phase "system" or "ai".
            "assistant" | "system" | "ai" => Ok(Self::Assistant),
            "human" => Ok(Self::Human),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Role recorded on every message in a session log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    User,
    Agent,
    Assistant,
    System,
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl FromStr for SenderRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown sender role: {other}")),
        }
    }
}

/// Agent availability as declared by the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
}

impl FromStr for Availability {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" | "online" => Ok(Self::Available),
            "busy" | "away" | "offline" => Ok(Self::Busy),
            other => Err(format!("unknown availability: {other}")),
        }
    }
}

/// A human identity attached to a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Participant {
    User(UserId),
    Agent(AgentId),
}

impl Participant {
    pub fn role(&self) -> SenderRole {
        match self {
            Self::User(_) => SenderRole::User,
            Self::Agent(_) => SenderRole::Agent,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// Author of a relayed message. Human senders carry their identity so the
/// router can check they belong to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sender {
    Participant(Participant),
    Assistant,
    System,
}

impl Sender {
    pub fn role(&self) -> SenderRole {
        match self {
            Self::Participant(p) => p.role(),
            Self::Assistant => SenderRole::Assistant,
            Self::System => SenderRole::System,
        }
    }
}

impl From<Participant> for Sender {
    fn from(p: Participant) -> Self {
        Self::Participant(p)
    }
}
