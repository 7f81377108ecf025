//! Event detectors: one platform event type in, one verdict out.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::Namespace;

pub mod raid;
pub mod spam;

pub use raid::{RaidDetector, RaidVerdict};
pub use spam::{IncomingMessage, SpamDetector, SpamVerdict};

/// What kind of raid a lockdown answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidKind {
    Join,
    Channel,
    Role,
    /// Operator-triggered or otherwise unattributed.
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown raid kind `{0}` (expected join, channel, role or general)")]
pub struct UnknownRaidKind(pub String);

impl RaidKind {
    pub const ALL: [RaidKind; 4] = [RaidKind::Join, RaidKind::Channel, RaidKind::Role, RaidKind::General];

    pub fn as_str(self) -> &'static str {
        match self {
            RaidKind::Join => "join",
            RaidKind::Channel => "channel",
            RaidKind::Role => "role",
            RaidKind::General => "general",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RaidKind::Join => "Join raid",
            RaidKind::Channel => "Channel raid",
            RaidKind::Role => "Role raid",
            RaidKind::General => "General",
        }
    }

    /// Cache namespace the detector of this kind counts in.
    pub fn namespace(self) -> Option<Namespace> {
        match self {
            RaidKind::Join => Some(Namespace::RecentJoins),
            RaidKind::Channel => Some(Namespace::RecentChannels),
            RaidKind::Role => Some(Namespace::RecentRoles),
            RaidKind::General => None,
        }
    }
}

impl fmt::Display for RaidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaidKind {
    type Err = UnknownRaidKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" | "joins" => Ok(RaidKind::Join),
            "channel" | "channels" => Ok(RaidKind::Channel),
            "role" | "roles" => Ok(RaidKind::Role),
            "general" | "" => Ok(RaidKind::General),
            _ => Err(UnknownRaidKind(s.to_string())),
        }
    }
}
