// src/lib.rs

pub mod audit;
pub mod cache;
pub mod commands;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod detectors;
pub mod discord;
pub mod guard;
pub mod lockdown;
pub mod logging;
pub mod platform;
pub mod remediation;
pub mod rules;

use anyhow::{Context as _, Result};
use std::sync::Arc;

use audit::{AuditSink, PgAudit, TracingAudit};
use config::Settings;
use db::Db;
use guard::RaidGuard;
use platform::Platform;
use rules::SettingsRules;

/// Process-wide context: settings, the optional audit database and the RaidGuard.
pub struct AppContext {
    pub settings: Settings,
    pub db: Option<Db>,
    guard: Arc<RaidGuard>,
}

impl AppContext {
    /// Full startup:
    /// - logging
    /// - DB and audit tables, only when `database.url` is set
    /// - RaidGuard over the Discord HTTP client
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let db = if settings.database.url.is_empty() {
            tracing::info!("database.url empty, incidents go to the log only");
            None
        } else {
            let db = db::connect(&settings.database.url, settings.database.max_connections)
                .await
                .context("connect audit database")?;
            db::ensure_tables(&db).await.context("create audit tables")?;
            Some(db)
        };

        let http = Arc::new(serenity::all::Http::new(&settings.discord.token));
        let platform: Arc<dyn Platform> = Arc::new(discord::SerenityPlatform::new(http));
        Ok(Self::with_platform(settings, db, platform))
    }

    /// Context over an arbitrary platform, used by `bootstrap` and by tests.
    pub fn with_platform(settings: Settings, db: Option<Db>, platform: Arc<dyn Platform>) -> Arc<Self> {
        let audit: Arc<dyn AuditSink> = match &db {
            Some(db) => Arc::new(PgAudit::new(db.clone())),
            None => Arc::new(TracingAudit),
        };
        let rules = Arc::new(SettingsRules::new(settings.raidguard.clone()));
        let guard = RaidGuard::new(platform, audit, rules, &settings.raidguard);

        Arc::new(Self { settings, db, guard })
    }

    pub fn guard(&self) -> Arc<RaidGuard> {
        self.guard.clone()
    }
}

/// Start the Discord client (gateway + slash commands).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
