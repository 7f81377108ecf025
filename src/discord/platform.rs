use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serenity::all::{
    ChannelId, ChannelType, Colour, CreateEmbed, CreateMessage, EditRole, GetMessages, GuildId, Http,
    MessageId, PermissionOverwrite, PermissionOverwriteType, Permissions, RoleId, UserId,
};
use serenity::async_trait;
use tracing::debug;

use crate::platform::{Alert, ChannelState, Overwrite, Platform, RecentMessage};

/// [`Platform`] over the Discord REST API.
pub struct SerenityPlatform {
    http: Arc<Http>,
    bot_id: OnceCell<UserId>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            bot_id: OnceCell::new(),
        }
    }

    async fn bot_id(&self) -> Result<UserId> {
        if let Some(id) = self.bot_id.get() {
            return Ok(*id);
        }
        let me = self.http.get_current_user().await?;
        let _ = self.bot_id.set(me.id);
        Ok(me.id)
    }
}

/// What the bot needs inside a channel to rewrite its overwrites.
const MANAGE_IN_CHANNEL: Permissions =
    Permissions::from_bits_truncate(Permissions::VIEW_CHANNEL.bits() | Permissions::MANAGE_ROLES.bits());

/// The bot's guild-wide standing.
struct Standing {
    user: UserId,
    roles: Vec<RoleId>,
    /// @everyone plus every role of the bot; everything for the owner or an administrator.
    base: Permissions,
}

impl SerenityPlatform {
    async fn standing(&self, guild_id: u64) -> Result<Standing> {
        let gid = GuildId::new(guild_id);
        let bot = self.bot_id().await?;
        let guild = gid.to_partial_guild(&self.http).await?;
        let member = gid.member(&self.http, bot).await?;

        let mut base = guild
            .roles
            .get(&RoleId::new(guild_id))
            .map(|r| r.permissions)
            .unwrap_or_else(Permissions::empty);
        for role in &member.roles {
            if let Some(r) = guild.roles.get(role) {
                base |= r.permissions;
            }
        }
        if guild.owner_id == bot || base.contains(Permissions::ADMINISTRATOR) {
            base = Permissions::all();
        }
        Ok(Standing {
            user: bot,
            roles: member.roles,
            base,
        })
    }
}

/// Effective permissions in one channel: @everyone overwrite, then the union of the
/// bot's role overwrites, then its member overwrite. Deny before allow at each step.
fn channel_permissions(standing: &Standing, everyone: RoleId, overwrites: &[PermissionOverwrite]) -> Permissions {
    if standing.base.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    let mut perms = standing.base;
    if let Some(o) = overwrites.iter().find(|o| o.kind == PermissionOverwriteType::Role(everyone)) {
        perms = perms.difference(o.deny).union(o.allow);
    }

    let (mut allow, mut deny) = (Permissions::empty(), Permissions::empty());
    for o in overwrites {
        if let PermissionOverwriteType::Role(role) = o.kind {
            if role != everyone && standing.roles.contains(&role) {
                allow |= o.allow;
                deny |= o.deny;
            }
        }
    }
    perms = perms.difference(deny).union(allow);

    if let Some(o) = overwrites
        .iter()
        .find(|o| o.kind == PermissionOverwriteType::Member(standing.user))
    {
        perms = perms.difference(o.deny).union(o.allow);
    }
    perms
}

/// Channels a lockdown touches. Categories are left alone.
fn lockable(kind: ChannelType) -> bool {
    matches!(
        kind,
        ChannelType::Text | ChannelType::News | ChannelType::Voice | ChannelType::Stage | ChannelType::Forum
    )
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn fetch_messages(&self, channel_id: u64, before: Option<u64>, limit: u8) -> Result<Vec<RecentMessage>> {
        let mut builder = GetMessages::new().limit(limit);
        if let Some(b) = before {
            builder = builder.before(MessageId::new(b));
        }
        let msgs = ChannelId::new(channel_id).messages(&self.http, builder).await?;
        Ok(msgs
            .into_iter()
            .filter_map(|m| {
                let created_at = DateTime::<Utc>::from_timestamp(m.timestamp.unix_timestamp(), 0)?;
                Some(RecentMessage {
                    id: m.id.get(),
                    author_id: m.author.id.get(),
                    created_at,
                })
            })
            .collect())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
        ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await?;
        Ok(())
    }

    async fn delete_messages(&self, channel_id: u64, message_ids: &[u64]) -> Result<()> {
        let ids: Vec<MessageId> = message_ids.iter().map(|id| MessageId::new(*id)).collect();
        ChannelId::new(channel_id).delete_messages(&self.http, ids).await?;
        Ok(())
    }

    async fn agent_permissions(&self, guild_id: u64) -> Result<Permissions> {
        Ok(self.standing(guild_id).await?.base)
    }

    async fn role_permissions(&self, guild_id: u64, role_id: u64) -> Result<Permissions> {
        let roles = GuildId::new(guild_id).roles(&self.http).await?;
        roles
            .get(&RoleId::new(role_id))
            .map(|r| r.permissions)
            .ok_or_else(|| anyhow!("role {role_id} not found in guild {guild_id}"))
    }

    async fn set_role_permissions(&self, guild_id: u64, role_id: u64, permissions: Permissions) -> Result<()> {
        GuildId::new(guild_id)
            .edit_role(&self.http, RoleId::new(role_id), EditRole::new().permissions(permissions))
            .await
            .with_context(|| format!("edit role {role_id}"))?;
        Ok(())
    }

    async fn lockdown_channels(&self, guild_id: u64) -> Result<Vec<ChannelState>> {
        let everyone = RoleId::new(guild_id);
        let standing = self.standing(guild_id).await?;
        let channels = GuildId::new(guild_id).channels(&self.http).await?;
        let mut skipped = 0usize;
        let mut out: Vec<ChannelState> = Vec::new();
        for c in channels.into_values().filter(|c| lockable(c.kind)) {
            if !channel_permissions(&standing, everyone, &c.permission_overwrites).contains(MANAGE_IN_CHANNEL) {
                skipped += 1;
                continue;
            }
            out.push(ChannelState {
                id: c.id.get(),
                is_text: matches!(c.kind, ChannelType::Text | ChannelType::News),
                everyone: c
                    .permission_overwrites
                    .iter()
                    .find(|o| o.kind == PermissionOverwriteType::Role(everyone))
                    .map(|o| Overwrite {
                        allow: o.allow,
                        deny: o.deny,
                    }),
            });
        }
        if skipped > 0 {
            debug!(gid = guild_id, skipped, "channels outside the bot's reach left unlocked");
        }
        // stable order so the alert fallback picks the same channel every time
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    async fn set_channel_overwrite(&self, channel_id: u64, role_id: u64, overwrite: Overwrite) -> Result<()> {
        ChannelId::new(channel_id)
            .create_permission(
                &self.http,
                PermissionOverwrite {
                    allow: overwrite.allow,
                    deny: overwrite.deny,
                    kind: PermissionOverwriteType::Role(RoleId::new(role_id)),
                },
            )
            .await?;
        Ok(())
    }

    async fn clear_channel_overwrite(&self, channel_id: u64, role_id: u64) -> Result<()> {
        ChannelId::new(channel_id)
            .delete_permission(&self.http, PermissionOverwriteType::Role(RoleId::new(role_id)))
            .await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: u64, reason: &str) -> Result<()> {
        self.http
            .delete_channel(ChannelId::new(channel_id), Some(reason))
            .await?;
        Ok(())
    }

    async fn send_alert(&self, channel_id: u64, alert: &Alert) -> Result<()> {
        let mut embed = CreateEmbed::new()
            .title(&alert.title)
            .description(&alert.description)
            .colour(Colour::new(alert.level.colour()))
            .timestamp(serenity::all::Timestamp::now());
        for (name, value) in &alert.fields {
            embed = embed.field(name, value, true);
        }
        ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await?;
        Ok(())
    }
}
