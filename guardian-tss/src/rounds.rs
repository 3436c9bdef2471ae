//! Rounds of the threshold signing protocol
//!
//! The signing protocol runs nine rounds. The first two are unicast-only, the rest are
//! broadcast-only. Messages are checked against the transport they arrived through.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Round of signing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SigningRound {
    /// Round 1 (unicast)
    Round1 = 1,
    /// Round 2 (unicast)
    Round2,
    /// Round 3 (broadcast)
    Round3,
    /// Round 4 (broadcast)
    Round4,
    /// Round 5 (broadcast)
    Round5,
    /// Round 6 (broadcast)
    Round6,
    /// Round 7 (broadcast)
    Round7,
    /// Round 8 (broadcast)
    Round8,
    /// Round 9 (broadcast)
    Round9,
}

/// Amount of broadcast rounds of a single signature
pub const NUM_BROADCAST_ROUNDS: usize = 7;
/// Amount of unicast rounds of a single signature
pub const NUM_UNICAST_ROUNDS: usize = 2;

impl SigningRound {
    /// All rounds in order
    pub const ALL: [SigningRound; 9] = [
        Self::Round1,
        Self::Round2,
        Self::Round3,
        Self::Round4,
        Self::Round5,
        Self::Round6,
        Self::Round7,
        Self::Round8,
        Self::Round9,
    ];

    /// Round number, starting from 1
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Returns round by its number
    pub fn from_number(n: u8) -> Option<Self> {
        n.checked_sub(1)
            .and_then(|i| Self::ALL.get(usize::from(i)))
            .copied()
    }

    /// Whether messages of this round must be sent via reliable broadcast
    pub fn is_broadcast(self) -> bool {
        !self.is_unicast()
    }

    /// Whether messages of this round must be sent via unicast
    pub fn is_unicast(self) -> bool {
        matches!(self, Self::Round1 | Self::Round2)
    }
}

impl TryFrom<u8> for SigningRound {
    type Error = UnknownRound;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::from_number(n).ok_or(UnknownRound(n))
    }
}

impl From<SigningRound> for u8 {
    fn from(round: SigningRound) -> u8 {
        round.number()
    }
}

impl fmt::Display for SigningRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round{}", self.number())
    }
}

/// Round number out of `1..=9`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown signing round {0}")]
pub struct UnknownRound(pub u8);
