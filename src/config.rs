use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::cache::{Namespace, NamespaceLimits};
use crate::rules::GuildRules;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub database: Database,
    pub logging: Logging,
    pub raidguard: RaidGuardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub app_id: Option<String>,
    pub intents: Vec<String>,
}

/// Audit store. An empty `url` keeps audit records in the logs only.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Database {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RaidGuardConfig {
    #[serde(default)]
    pub defaults: GuildRules,
    #[serde(default)]
    pub guilds: Vec<GuildRulesOverride>,
    #[serde(default)]
    pub lockdown: LockdownConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    pub rules_cache_ttl_secs: Option<u64>,
}

impl RaidGuardConfig {
    pub fn rules_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rules_cache_ttl_secs.unwrap_or(300))
    }

    /// Namespace limits with each retention raised to the longest window of any rule
    /// (defaults and per-guild overrides) that counts in that namespace. The sweeper
    /// must never drop an event a rule still sees.
    pub fn effective_cache_limits(&self) -> HashMap<Namespace, NamespaceLimits> {
        let mut limits = self.cache.limits();
        let rules = std::iter::once(&self.defaults).chain(self.guilds.iter().map(|g| &g.rules));
        for (ns, window_secs) in rules.flat_map(GuildRules::windows) {
            let l = limits.entry(ns).or_default();
            if l.retention_secs < window_secs {
                tracing::info!(namespace = %ns, configured = l.retention_secs, window_secs, "cache retention raised to rule window");
                l.retention_secs = window_secs;
            }
        }
        limits
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildRulesOverride {
    pub guild_id: u64,
    pub rules: GuildRules,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockdownConfig {
    pub min_minutes: u32,
    pub max_minutes: u32,
    /// Breaches of the same (guild, raid kind) within this window collapse into one.
    pub debounce_secs: u64,
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            min_minutes: 1,
            max_minutes: 24 * 60,
            debounce_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PurgeConfig {
    pub fetch_pages: u8,
    pub page_size: u8,
    pub batch_size: usize,
    /// Bulk delete refuses messages older than this.
    pub max_age_days: i64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            fetch_pages: 3,
            page_size: 100,
            batch_size: 100,
            max_age_days: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub recent_messages: NamespaceLimits,
    pub recent_joins: NamespaceLimits,
    pub recent_channels: NamespaceLimits,
    pub recent_roles: NamespaceLimits,
}

impl CacheConfig {
    pub fn limits(&self) -> HashMap<Namespace, NamespaceLimits> {
        HashMap::from([
            (Namespace::RecentMessages, self.recent_messages),
            (Namespace::RecentJoins, self.recent_joins),
            (Namespace::RecentChannels, self.recent_channels),
            (Namespace::RecentRoles, self.recent_roles),
        ])
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let per_guild = NamespaceLimits {
            max_keys: 5_000,
            retention_secs: 600,
            sweep_every_secs: 60,
        };
        Self {
            recent_messages: NamespaceLimits {
                max_keys: 50_000,
                retention_secs: 120,
                sweep_every_secs: 30,
            },
            recent_joins: per_guild,
            recent_channels: per_guild,
            recent_roles: per_guild,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommandConfig {
    /// Per-user cooldown of the /lockdown command.
    pub cooldown_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { cooldown_secs: 5 }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Which environment?
        let env = std::env::var("TSS_ENV").unwrap_or_else(|_| "development".to_string());

        // .env.<env> first, then .env
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        let defaults = Settings {
            env: env.clone(),
            app: App {
                name: "Tigris RaidGuard".into(),
            },
            discord: Discord {
                token: "".into(),
                app_id: None,
                intents: vec![
                    "GUILDS".into(),
                    "GUILD_MEMBERS".into(),
                    "GUILD_MESSAGES".into(),
                ],
            },
            database: Database {
                url: "".into(),
                max_connections: Some(5),
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            raidguard: RaidGuardConfig::default(),
        };

        // defaults -> config/<env>.toml -> TSS_* env vars
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // TSS_DATABASE__URL => database.url, TSS_RAIDGUARD__LOCKDOWN__MAX_MINUTES => ...
            .merge(Env::prefixed("TSS_").split("__"));

        let mut s: Settings = figment.extract()?;
        s.env = env;

        if s.database.max_connections.is_none() {
            s.database.max_connections = Some(5);
        }

        Ok(s)
    }

    /// Settings for tests and embedding: no token, no database, default rules.
    pub fn for_testing() -> Self {
        Self {
            env: "test".into(),
            app: App { name: "test".into() },
            discord: Discord {
                token: String::new(),
                app_id: None,
                intents: vec![],
            },
            database: Database {
                url: String::new(),
                max_connections: Some(1),
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            raidguard: RaidGuardConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn toml_and_env_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("TSS_ENV", "staging");
            jail.create_dir("config")?;
            jail.create_file(
                "config/staging.toml",
                r#"
                [raidguard.lockdown]
                min_minutes = 5
                max_minutes = 60
                debounce_secs = 10

                [[raidguard.guilds]]
                guild_id = 42
                [raidguard.guilds.rules]
                alert_channel = 900
                "#,
            )?;
            jail.set_env("TSS_DISCORD__TOKEN", "abc");

            let s = Settings::load().map_err(|e| e.to_string())?;
            assert_eq!(s.env, "staging");
            assert_eq!(s.discord.token, "abc");
            assert_eq!(s.raidguard.lockdown.max_minutes, 60);
            assert_eq!(s.raidguard.guilds[0].guild_id, 42);
            assert_eq!(s.raidguard.guilds[0].rules.alert_channel, Some(900));
            assert_eq!(s.raidguard.guilds[0].rules.join_raid, GuildRules::default().join_raid);
            assert_eq!(s.raidguard.purge, PurgeConfig::default());
            Ok(())
        });
    }

    #[test]
    fn retention_follows_the_longest_rule_window() {
        let mut cfg = RaidGuardConfig::default();
        if let Some(join) = cfg.defaults.join_raid.as_mut() {
            join.window_secs = 1200;
        }
        let mut slow_roles = GuildRules::default();
        if let Some(role) = slow_roles.role_raid.as_mut() {
            role.window_secs = 3600;
        }
        cfg.guilds.push(GuildRulesOverride { guild_id: 9, rules: slow_roles });

        let limits = cfg.effective_cache_limits();
        assert_eq!(limits[&Namespace::RecentJoins].retention_secs, 1200);
        assert_eq!(limits[&Namespace::RecentRoles].retention_secs, 3600);
        // short windows keep the configured retention
        assert_eq!(limits[&Namespace::RecentChannels].retention_secs, 600);
        assert_eq!(limits[&Namespace::RecentMessages].retention_secs, 120);
    }

    #[test]
    fn partial_guild_override_keeps_default_detectors() {
        let rules: GuildRules = Figment::new()
            .merge(Toml::string("alert_channel = 900\n[join_raid]\nenabled = true\nthreshold = 8\nwindow_secs = 10\nlockdown_minutes = 30"))
            .extract()
            .unwrap();
        assert_eq!(rules.alert_channel, Some(900));
        assert_eq!(rules.join_raid.map(|r| r.threshold), Some(8));
        assert_eq!(rules.spam, GuildRules::default().spam);
        assert_eq!(rules.role_raid, GuildRules::default().role_raid);
    }

    #[test]
    fn cache_limits_cover_every_namespace() {
        let limits = CacheConfig::default().limits();
        for ns in Namespace::ALL {
            assert!(limits.contains_key(&ns));
        }
    }
}
