//! Conversation Phases
//!
//! Closed set of task phases and the transition graph between them.
//! Forward transitions are what the router may choose; backtracks are only
//! taken explicitly after a correction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Open-ended conversation, requirements gathering
    Chat,
    /// Breaking the task into steps
    Plan,
    /// Doing the work (usually a coding agent)
    Execute,
    /// Checking the work
    Review,
    /// Terminal
    Done,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Chat,
        Phase::Plan,
        Phase::Execute,
        Phase::Review,
        Phase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Review => "review",
            Self::Done => "done",
        }
    }

    /// One-line description used in routing menus
    pub fn description(&self) -> &'static str {
        match self {
            Self::Chat => "clarify what the user wants",
            Self::Plan => "decompose the task into concrete steps",
            Self::Execute => "implement the plan",
            Self::Review => "verify the implementation",
            Self::Done => "the task is finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Declared forward transitions
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Self::Chat => &[Phase::Plan, Phase::Execute, Phase::Done],
            Self::Plan => &[Phase::Execute],
            Self::Execute => &[Phase::Review],
            Self::Review => &[Phase::Done],
            Self::Done => &[],
        }
    }

    /// Correction-triggered backtracks
    pub fn backtracks(&self) -> &'static [Phase] {
        match self {
            Self::Chat => &[],
            Self::Plan => &[Phase::Chat],
            Self::Execute => &[Phase::Plan],
            Self::Review => &[Phase::Execute, Phase::Plan],
            Self::Done => &[],
        }
    }

    /// Staying put (non-terminal) or moving along the forward graph
    pub fn can_advance_to(&self, next: Phase) -> bool {
        if *self == next {
            return true;
        }
        self.successors().contains(&next)
    }

    pub fn can_backtrack_to(&self, previous: Phase) -> bool {
        self.backtracks().contains(&previous)
    }

    /// Phases the router may pick from this phase, current phase first
    pub fn legal_next(&self) -> Vec<Phase> {
        let mut phases = vec![*self];
        phases.extend_from_slice(self.successors());
        phases
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "plan" => Ok(Self::Plan),
            "execute" => Ok(Self::Execute),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            other => Err(format!("Unknown phase: {}", other)),
        }
    }
}
