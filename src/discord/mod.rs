// src/discord/mod.rs
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures_util::FutureExt;
use serenity::all::*;
use serenity::async_trait;

use crate::AppContext;
use crate::commands;
use crate::detectors::{IncomingMessage, RaidVerdict, SpamVerdict};
use crate::guard::RaidGuard;

mod platform;

pub use platform::SerenityPlatform;

pub struct Handler {
    pub guard: Arc<RaidGuard>,
}

fn log_raid(gid: u64, source: &str, verdict: &RaidVerdict) {
    match verdict {
        RaidVerdict::Ignored | RaidVerdict::Counted(_) => {}
        RaidVerdict::Lockdown(outcome) => {
            tracing::info!(gid, source, outcome=?outcome, "raid verdict");
        }
        other => tracing::debug!(gid, source, verdict=?other, "raid verdict"),
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        for g in ready.guilds {
            if let Err(e) = commands::register_commands(&ctx, g.id).await {
                tracing::warn!(error=?e, gid=%g.id.get(), "register lockdown command failed");
            }
        }
    }

    // _is_new zgodnie z Serenity 0.12
    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if let Err(e) = commands::register_commands(&ctx, guild.id).await {
            tracing::warn!(error=?e, gid=%guild.id.get(), "register lockdown command failed (on guild_create)");
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if !incomplete.unavailable {
            self.guard.forget_guild(incomplete.id.get()).await;
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        let incoming = IncomingMessage {
            guild_id: gid.get(),
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            author_is_bot: msg.author.bot || msg.webhook_id.is_some(),
            author_roles: msg
                .member
                .as_ref()
                .map(|m| m.roles.iter().map(|r| r.get()).collect())
                .unwrap_or_default(),
        };
        match self.guard.on_message(&incoming).await {
            SpamVerdict::Purged(summary) => {
                tracing::info!(gid=%gid.get(), uid=%msg.author.id.get(), deleted = summary.succeeded, failed = summary.failed, "spam purged");
            }
            SpamVerdict::Suppressed => {
                tracing::debug!(gid=%gid.get(), uid=%msg.author.id.get(), "message dropped during cooldown");
            }
            SpamVerdict::Ignored | SpamVerdict::Counted(_) => {}
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let gid = member.guild_id.get();
        let verdict = self.guard.on_member_join(gid).await;
        log_raid(gid, "member_join", &verdict);
    }

    async fn channel_create(&self, _ctx: Context, channel: GuildChannel) {
        let gid = channel.guild_id.get();
        let verdict = self.guard.on_channel_create(gid, channel.id.get()).await;
        log_raid(gid, "channel_create", &verdict);
    }

    async fn guild_role_create(&self, _ctx: Context, new: Role) {
        let gid = new.guild_id.get();
        let verdict = self.guard.on_role_create(gid).await;
        log_raid(gid, "role_create", &verdict);
    }

    /// Slash commands only.
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(cmd) = interaction else {
            return;
        };
        let fut = commands::on_interaction(&ctx, &self.guard, &cmd);
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!(command=%cmd.data.name, gid=?cmd.guild_id, "interaction handler panicked");
        }
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            other => tracing::warn!(intent = other, "unknown gateway intent ignored"),
        }
    }
    i
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("missing Discord token (TSS_DISCORD__TOKEN), set it in .env");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);

    let guard = ctx.guard();
    guard.start();
    let handler = Handler { guard };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!(app = %ctx.settings.app.name, "Discord client starting…");
    client.start().await?;
    Ok(())
}
