//! Lockdown permission policy and the pure snapshot/restore planning.
//!
//! One canonical "read-only" policy: members keep seeing channels and history, and
//! lose everything that writes (messages, threads, reactions, files, invites, voice,
//! nickname changes, app commands).

use serde::{Deserialize, Serialize};
use serenity::all::Permissions;

use crate::platform::Overwrite;

pub const LOCKDOWN_DENY: Permissions = Permissions::from_bits_truncate(
    Permissions::SEND_MESSAGES.bits()
        | Permissions::SEND_MESSAGES_IN_THREADS.bits()
        | Permissions::CREATE_PUBLIC_THREADS.bits()
        | Permissions::CREATE_PRIVATE_THREADS.bits()
        | Permissions::ADD_REACTIONS.bits()
        | Permissions::ATTACH_FILES.bits()
        | Permissions::EMBED_LINKS.bits()
        | Permissions::MENTION_EVERYONE.bits()
        | Permissions::CREATE_INSTANT_INVITE.bits()
        | Permissions::CONNECT.bits()
        | Permissions::SPEAK.bits()
        | Permissions::CHANGE_NICKNAME.bits()
        | Permissions::USE_APPLICATION_COMMANDS.bits(),
);

/// @everyone permissions restored when a lockdown has no role snapshot.
pub const SAFE_DEFAULT_EVERYONE: Permissions = Permissions::from_bits_truncate(
    Permissions::VIEW_CHANNEL.bits()
        | Permissions::READ_MESSAGE_HISTORY.bits()
        | Permissions::SEND_MESSAGES.bits()
        | Permissions::SEND_MESSAGES_IN_THREADS.bits()
        | Permissions::CREATE_PUBLIC_THREADS.bits()
        | Permissions::ADD_REACTIONS.bits()
        | Permissions::EMBED_LINKS.bits()
        | Permissions::ATTACH_FILES.bits()
        | Permissions::USE_EXTERNAL_EMOJIS.bits()
        | Permissions::CONNECT.bits()
        | Permissions::SPEAK.bits()
        | Permissions::CHANGE_NICKNAME.bits()
        | Permissions::USE_APPLICATION_COMMANDS.bits(),
);

const REQUIRED_AGENT: Permissions = Permissions::from_bits_truncate(
    Permissions::MANAGE_ROLES.bits() | Permissions::MANAGE_CHANNELS.bits(),
);

pub fn agent_can_lock(agent: Permissions) -> bool {
    agent.contains(Permissions::ADMINISTRATOR) || agent.contains(REQUIRED_AGENT)
}

pub fn locked_role(original: Permissions) -> Permissions {
    original.difference(LOCKDOWN_DENY)
}

pub fn locked_overwrite(original: Option<Overwrite>) -> Overwrite {
    let original = original.unwrap_or(Overwrite {
        allow: Permissions::empty(),
        deny: Permissions::empty(),
    });
    Overwrite {
        allow: original.allow.difference(LOCKDOWN_DENY),
        deny: original.deny.union(LOCKDOWN_DENY),
    }
}

/// State captured before the first lockdown mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownSnapshot {
    /// @everyone permissions; `None` when the read failed.
    pub role: Option<Permissions>,
    /// Channel id and its @everyone overwrite (`None` = inherited).
    pub channels: Vec<(u64, Option<Overwrite>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRestore {
    Reapply(Overwrite),
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    /// Role permissions to write, `None` when the role already matches.
    pub role: Option<Permissions>,
    /// The target came from [`SAFE_DEFAULT_EVERYONE`] instead of a snapshot.
    pub role_fallback: bool,
    pub channels: Vec<(u64, ChannelRestore)>,
}

/// Plan the restoration from what was captured and what the role looks like now.
pub fn plan_restore(snapshot: &LockdownSnapshot, current_role: Option<Permissions>) -> RestorePlan {
    let target = snapshot.role.unwrap_or(SAFE_DEFAULT_EVERYONE);
    let role = match current_role {
        Some(current) if current == target => None,
        _ => Some(target),
    };
    let channels = snapshot
        .channels
        .iter()
        .map(|(id, ow)| {
            let action = match ow {
                Some(ow) => ChannelRestore::Reapply(*ow),
                None => ChannelRestore::Inherit,
            };
            (*id, action)
        })
        .collect();
    RestorePlan {
        role,
        role_fallback: snapshot.role.is_none(),
        channels,
    }
}
