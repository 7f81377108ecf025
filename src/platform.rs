//! Seam between the guard and the chat platform.
//!
//! Everything the guard does to a guild goes through [`Platform`]. The bot wires in
//! [`crate::discord::SerenityPlatform`]; tests wire in a recording mock.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::all::Permissions;
use serenity::async_trait;

/// One message from channel history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentMessage {
    pub id: u64,
    pub author_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Allow/deny pair of a role permission overwrite on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overwrite {
    pub allow: Permissions,
    pub deny: Permissions,
}

/// A channel the agent can put under lockdown, with its current @everyone overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub id: u64,
    pub is_text: bool,
    pub everyone: Option<Overwrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn colour(self) -> u32 {
        match self {
            AlertLevel::Info => 0x2ECC71,
            AlertLevel::Warning => 0xF1C40F,
            AlertLevel::Critical => 0xE74C3C,
        }
    }
}

/// Human-readable alert, rendered as an embed by the Discord adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub title: String,
    pub description: String,
    pub level: AlertLevel,
    pub fields: Vec<(String, String)>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            level,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }
}

/// Operations the guard consumes from the platform client.
///
/// On Discord the @everyone role id equals the guild id.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Up to `limit` messages, newest first, strictly older than `before` when given.
    async fn fetch_messages(
        &self,
        channel_id: u64,
        before: Option<u64>,
        limit: u8,
    ) -> Result<Vec<RecentMessage>>;
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()>;
    /// Bulk delete of 2..=100 messages.
    async fn delete_messages(&self, channel_id: u64, message_ids: &[u64]) -> Result<()>;

    /// Guild-level permissions of the bot itself.
    async fn agent_permissions(&self, guild_id: u64) -> Result<Permissions>;
    async fn role_permissions(&self, guild_id: u64, role_id: u64) -> Result<Permissions>;
    async fn set_role_permissions(
        &self,
        guild_id: u64,
        role_id: u64,
        permissions: Permissions,
    ) -> Result<()>;

    /// Channels the bot can manage, with their current @everyone overwrite.
    async fn lockdown_channels(&self, guild_id: u64) -> Result<Vec<ChannelState>>;
    async fn set_channel_overwrite(
        &self,
        channel_id: u64,
        role_id: u64,
        overwrite: Overwrite,
    ) -> Result<()>;
    /// Remove the role overwrite so the channel inherits again.
    async fn clear_channel_overwrite(&self, channel_id: u64, role_id: u64) -> Result<()>;
    async fn delete_channel(&self, channel_id: u64, reason: &str) -> Result<()>;

    async fn send_alert(&self, channel_id: u64, alert: &Alert) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory guild that records every call made against it.

    use super::*;
    use anyhow::anyhow;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        DeleteMessage(u64, u64),
        DeleteMessages(u64, Vec<u64>),
        SetRole(u64, Permissions),
        SetOverwrite(u64, Overwrite),
        ClearOverwrite(u64),
        DeleteChannel(u64),
        Alert(u64, String),
    }

    #[derive(Debug, Default)]
    pub struct State {
        pub agent: Permissions,
        pub roles: HashMap<u64, Permissions>,
        pub channels: Vec<ChannelState>,
        pub messages: HashMap<u64, Vec<RecentMessage>>,
        pub calls: Vec<Call>,
        pub fail_bulk: bool,
        pub fail_role_read: bool,
        pub fail_messages: HashSet<u64>,
        pub fail_channels: HashSet<u64>,
    }

    #[derive(Debug, Default)]
    pub struct MockPlatform {
        pub state: Mutex<State>,
    }

    impl MockPlatform {
        /// Guild `guild_id` with @everyone holding `everyone` and text channels `channels`.
        pub fn guild(guild_id: u64, everyone: Permissions, channels: &[u64]) -> Self {
            let mock = Self::default();
            {
                let mut s = mock.state.lock().unwrap();
                s.agent = Permissions::ADMINISTRATOR;
                s.roles.insert(guild_id, everyone);
                s.channels = channels
                    .iter()
                    .map(|&id| ChannelState { id, is_text: true, everyone: None })
                    .collect();
            }
            mock
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        pub fn calls(&self) -> Vec<Call> {
            self.with(|s| s.calls.clone())
        }

        pub fn alerts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Alert(_, title) => Some(title),
                    _ => None,
                })
                .collect()
        }

        pub fn role(&self, role_id: u64) -> Permissions {
            self.with(|s| s.roles.get(&role_id).copied().unwrap_or_default())
        }

        pub fn overwrite(&self, channel_id: u64) -> Option<Overwrite> {
            self.with(|s| {
                s.channels
                    .iter()
                    .find(|c| c.id == channel_id)
                    .and_then(|c| c.everyone)
            })
        }
    }

    #[async_trait]
    impl Platform for MockPlatform {
        async fn fetch_messages(
            &self,
            channel_id: u64,
            before: Option<u64>,
            limit: u8,
        ) -> Result<Vec<RecentMessage>> {
            self.with(|s| {
                let mut list: Vec<RecentMessage> = s
                    .messages
                    .get(&channel_id)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|m| before.is_none_or(|b| m.id < b))
                    .collect();
                list.sort_by(|a, b| b.id.cmp(&a.id));
                list.truncate(limit as usize);
                Ok(list)
            })
        }

        async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
            self.with(|s| {
                if s.fail_messages.contains(&message_id) {
                    return Err(anyhow!("unknown message {message_id}"));
                }
                s.calls.push(Call::DeleteMessage(channel_id, message_id));
                if let Some(list) = s.messages.get_mut(&channel_id) {
                    list.retain(|m| m.id != message_id);
                }
                Ok(())
            })
        }

        async fn delete_messages(&self, channel_id: u64, message_ids: &[u64]) -> Result<()> {
            self.with(|s| {
                if s.fail_bulk {
                    return Err(anyhow!("bulk delete rejected"));
                }
                s.calls.push(Call::DeleteMessages(channel_id, message_ids.to_vec()));
                if let Some(list) = s.messages.get_mut(&channel_id) {
                    list.retain(|m| !message_ids.contains(&m.id));
                }
                Ok(())
            })
        }

        async fn agent_permissions(&self, _guild_id: u64) -> Result<Permissions> {
            Ok(self.with(|s| s.agent))
        }

        async fn role_permissions(&self, _guild_id: u64, role_id: u64) -> Result<Permissions> {
            self.with(|s| {
                if s.fail_role_read {
                    return Err(anyhow!("role fetch failed"));
                }
                s.roles
                    .get(&role_id)
                    .copied()
                    .ok_or_else(|| anyhow!("unknown role {role_id}"))
            })
        }

        async fn set_role_permissions(
            &self,
            _guild_id: u64,
            role_id: u64,
            permissions: Permissions,
        ) -> Result<()> {
            self.with(|s| {
                s.calls.push(Call::SetRole(role_id, permissions));
                s.roles.insert(role_id, permissions);
                Ok(())
            })
        }

        async fn lockdown_channels(&self, _guild_id: u64) -> Result<Vec<ChannelState>> {
            Ok(self.with(|s| s.channels.clone()))
        }

        async fn set_channel_overwrite(
            &self,
            channel_id: u64,
            _role_id: u64,
            overwrite: Overwrite,
        ) -> Result<()> {
            self.with(|s| {
                if s.fail_channels.contains(&channel_id) {
                    return Err(anyhow!("missing access to {channel_id}"));
                }
                s.calls.push(Call::SetOverwrite(channel_id, overwrite));
                if let Some(c) = s.channels.iter_mut().find(|c| c.id == channel_id) {
                    c.everyone = Some(overwrite);
                }
                Ok(())
            })
        }

        async fn clear_channel_overwrite(&self, channel_id: u64, _role_id: u64) -> Result<()> {
            self.with(|s| {
                if s.fail_channels.contains(&channel_id) {
                    return Err(anyhow!("missing access to {channel_id}"));
                }
                s.calls.push(Call::ClearOverwrite(channel_id));
                if let Some(c) = s.channels.iter_mut().find(|c| c.id == channel_id) {
                    c.everyone = None;
                }
                Ok(())
            })
        }

        async fn delete_channel(&self, channel_id: u64, _reason: &str) -> Result<()> {
            self.with(|s| {
                if s.fail_channels.contains(&channel_id) {
                    return Err(anyhow!("missing access to {channel_id}"));
                }
                s.calls.push(Call::DeleteChannel(channel_id));
                s.channels.retain(|c| c.id != channel_id);
                Ok(())
            })
        }

        async fn send_alert(&self, channel_id: u64, alert: &Alert) -> Result<()> {
            self.with(|s| {
                s.calls.push(Call::Alert(channel_id, alert.title.clone()));
                Ok(())
            })
        }
    }
}
