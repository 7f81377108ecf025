//! `/lockdown start|end|status` for operators.

use anyhow::Result;
use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandInteraction, CommandOptionType, Context,
    CreateCommand, CreateCommandOption, EditInteractionResponse, GuildId, Permissions,
};
use tracing::{debug, warn};

use crate::detectors::RaidKind;
use crate::guard::RaidGuard;
use crate::lockdown::{LockdownOutcome, LockdownRequest, RejectReason, UnlockOutcome};

pub const COMMAND: &str = "lockdown";

const DEFAULT_MINUTES: u32 = 10;

pub async fn register_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id
        .create_command(
            &ctx.http,
            CreateCommand::new(COMMAND)
                .description("Server lockdown")
                .default_member_permissions(Permissions::MANAGE_GUILD)
                .add_option(
                    CreateCommandOption::new(CommandOptionType::SubCommand, "start", "Lock the server now")
                        .add_sub_option(
                            CreateCommandOption::new(CommandOptionType::Integer, "minutes", "Duration in minutes")
                                .min_int_value(1)
                                .required(false),
                        )
                        .add_sub_option(
                            CreateCommandOption::new(
                                CommandOptionType::String,
                                "kind",
                                "join | channel | role | general",
                            )
                            .required(false),
                        )
                        .add_sub_option(
                            CreateCommandOption::new(CommandOptionType::String, "reason", "Shown in the alert")
                                .required(false),
                        ),
                )
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "end",
                    "Lift the lockdown and restore permissions",
                ))
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "status",
                    "Show the current lockdown",
                )),
        )
        .await?;
    Ok(())
}

/// Options of `/lockdown start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartArgs {
    pub minutes: Option<i64>,
    pub kind: Option<String>,
    pub reason: Option<String>,
}

impl StartArgs {
    fn from_options(sub: &CommandDataOption) -> Self {
        let mut args = StartArgs::default();
        let CommandDataOptionValue::SubCommand(options) = &sub.value else {
            return args;
        };
        for o in options {
            match (o.name.as_str(), &o.value) {
                ("minutes", CommandDataOptionValue::Integer(m)) => args.minutes = Some(*m),
                ("kind", CommandDataOptionValue::String(k)) => args.kind = Some(k.clone()),
                ("reason", CommandDataOptionValue::String(r)) => args.reason = Some(r.clone()),
                _ => {}
            }
        }
        args
    }
}

/// Run a subcommand and return the operator-facing reply.
pub async fn handle_subcommand(
    guard: &RaidGuard,
    guild_id: u64,
    channel_id: u64,
    user_id: u64,
    name: &str,
    args: &StartArgs,
) -> String {
    match name {
        "start" => cmd_start(guard, guild_id, channel_id, user_id, args).await,
        "end" => match guard.lockdown().manual_unlock(guild_id, user_id).await {
            UnlockOutcome::Restored(r) => {
                let mut out = format!("lockdown lifted, {} channel(s) restored", r.channels.succeeded);
                if r.channels.failed > 0 {
                    out.push_str(&format!(", {} failed", r.channels.failed));
                }
                if r.used_fallback {
                    out.push_str(" (role restored from safe defaults)");
                }
                out
            }
            UnlockOutcome::NotLocked => "no active lockdown".into(),
            UnlockOutcome::InTransition => "lockdown is changing state, try again shortly".into(),
        },
        "status" => match guard.lockdown().status(guild_id) {
            Some(s) => format!(
                "{} lockdown ({:?}) since {}, {} min left",
                s.kind.label(),
                s.phase,
                s.started_at.format("%Y-%m-%d %H:%M UTC"),
                s.remaining.as_secs().div_ceil(60)
            ),
            None => "no active lockdown".into(),
        },
        _ => String::new(),
    }
}

async fn cmd_start(guard: &RaidGuard, guild_id: u64, channel_id: u64, user_id: u64, args: &StartArgs) -> String {
    let kind = match args.kind.as_deref().map(str::parse::<RaidKind>) {
        None => RaidKind::General,
        Some(Ok(kind)) => kind,
        Some(Err(e)) => return format!("lockdown rejected: {}", RejectReason::UnknownKind(e.0)),
    };
    let minutes = args
        .minutes
        .map(|m| u32::try_from(m.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(DEFAULT_MINUTES);
    let alert_channel = guard.alert_channel(guild_id).await.or(Some(channel_id));
    let reason = args
        .reason
        .clone()
        .unwrap_or_else(|| format!("Manual lockdown by <@{user_id}>."));

    let req = LockdownRequest {
        guild_id,
        minutes,
        kind,
        alert_channel,
        delete_created_channels: false,
        reason,
    };
    match guard.lockdown().apply_lockdown(req).await {
        LockdownOutcome::Applied(r) => {
            let mut out = format!("lockdown active for {minutes} min, {} channel(s) locked", r.channels.succeeded);
            if r.channels.failed > 0 {
                out.push_str(&format!(", {} failed", r.channels.failed));
            }
            if !r.snapshot_complete {
                out.push_str(" (warning: @everyone snapshot unavailable)");
            }
            out
        }
        LockdownOutcome::Rejected(reason) => format!("lockdown rejected: {reason}"),
    }
}

/// Interaction entry point. Calls from users still on cooldown get no reply.
pub async fn on_interaction(ctx: &Context, guard: &RaidGuard, cmd: &CommandInteraction) {
    if cmd.data.name != COMMAND {
        return;
    }
    let Some(guild_id) = cmd.guild_id else {
        return;
    };
    let Some(sub) = cmd.data.options.first() else {
        return;
    };
    if !guard.command_allowed(guild_id.get(), cmd.user.id.get(), COMMAND) {
        debug!(gid = guild_id.get(), uid = cmd.user.id.get(), "lockdown command on cooldown");
        return;
    }

    if let Err(err) = cmd.defer_ephemeral(&ctx.http).await {
        warn!(error=?err, "failed to defer lockdown interaction");
    }
    let content = handle_subcommand(
        guard,
        guild_id.get(),
        cmd.channel_id.get(),
        cmd.user.id.get(),
        &sub.name,
        &StartArgs::from_options(sub),
    )
    .await;

    if let Err(err) = cmd
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await
    {
        warn!(error=?err, "failed to edit lockdown response");
    }
}
