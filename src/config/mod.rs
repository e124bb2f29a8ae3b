//! Application configuration management
//!
//! Everything comes from environment variables (a `.env` file is loaded first by the
//! binary). Missing credentials or malformed values are fatal before any work starts.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

use crate::error::ConfigError;
use crate::media::Library;
use crate::services::escalation::{CooldownTiers, EscalationPolicy};
use crate::services::resolver::DEFAULT_ACCEPTANCE_THRESHOLD;

/// Tuning of the reconciliation engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items per scan window
    pub chunk_size: usize,
    /// Wall-clock budget of a run
    pub time_budget: Duration,
    /// Maximum items examined per run
    pub item_quota: usize,
    pub cooldown_tiers: CooldownTiers,
    /// Consecutive failures after which an item is archived as dead
    pub dead_threshold: u32,
    /// Library titles or ids never scanned (case-insensitive)
    pub excluded_libraries: Vec<String>,
    /// Changed items are only re-examined if they changed within this window
    pub lookback: TimeDelta,
    pub resolver_threshold: f64,
    pub pool_size: u32,
    pub library_concurrency: usize,
    /// Liveness re-checks before a run is aborted
    pub offline_retries: u32,
    pub boot_grace: Duration,
    pub busy_poll_interval: Duration,
    /// Pause between a refresh request and re-fetching the item
    pub refresh_settle: Duration,
    pub sample_interval: Duration,
    pub sample_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            time_budget: Duration::from_secs(600),
            item_quota: 200,
            cooldown_tiers: CooldownTiers::default(),
            dead_threshold: 5,
            excluded_libraries: Vec::new(),
            lookback: TimeDelta::days(30),
            resolver_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            pool_size: 3,
            library_concurrency: 1,
            offline_retries: 3,
            boot_grace: Duration::from_secs(120),
            busy_poll_interval: Duration::from_secs(10),
            refresh_settle: Duration::from_secs(1),
            sample_interval: Duration::from_secs(1),
            sample_window: 120,
        }
    }
}

impl EngineConfig {
    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            tiers: self.cooldown_tiers.clone(),
            dead_threshold: self.dead_threshold,
        }
    }

    pub fn is_excluded(&self, library: &Library) -> bool {
        self.excluded_libraries.iter().any(|excluded| {
            excluded.eq_ignore_ascii_case(&library.title) || excluded == &library.id
        })
    }

    /// Libraries processed at once, never more than the store has connections
    pub fn effective_concurrency(&self) -> usize {
        self.library_concurrency.clamp(1, self.pool_size.max(1) as usize)
    }
}

/// When runs are meant to happen. The binary does not schedule itself; this is only
/// reported so the operator can see the next expected run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval_days: u32,
    pub time_of_day: NaiveTime,
}

impl Schedule {
    /// First run time strictly after `now`
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let step = TimeDelta::days(i64::from(self.interval_days.max(1)));
        let mut next = now.date().and_time(self.time_of_day);
        while next <= now {
            next += step;
        }
        next
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub discord_webhook: Option<String>,
    pub telegram: Option<TelegramConfig>,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub plex_url: String,
    pub plex_token: String,
    pub plex_timeout: Duration,

    pub tmdb_api_key: String,

    /// Directory of the log sinks
    pub log_dir: PathBuf,
    pub database_path: PathBuf,
    pub health_file: PathBuf,

    pub schedule: Option<Schedule>,
    pub notifications: NotificationConfig,
    pub engine: EngineConfig,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Longest accepted cooldown tier or lookback, in days
const MAX_DAYS: i64 = 3650;
/// Longest accepted run time budget
const MAX_TIME_BUDGET_SECS: u64 = 7 * 86_400;

fn optional(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: Lookup<'_>, key: &'static str) -> Result<String, ConfigError> {
    optional(lookup, key).ok_or(ConfigError::Missing(key))
}

fn parsed<T>(lookup: Lookup<'_>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn flag(lookup: Lookup<'_>, key: &'static str) -> Result<bool, ConfigError> {
    match optional(lookup, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            value: v,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn positive<T>(key: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}

fn at_most<T>(key: &'static str, value: T, max: T) -> Result<T, ConfigError>
where
    T: PartialOrd + ToString,
{
    if value <= max {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: format!("must be at most {}", max.to_string()),
        })
    }
}

fn days(key: &'static str, value: i64) -> Result<TimeDelta, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must not be negative".to_string(),
        });
    }
    at_most(key, value, MAX_DAYS).map(TimeDelta::days)
}

fn cooldown_tiers(lookup: Lookup<'_>) -> Result<CooldownTiers, ConfigError> {
    const KEY: &str = "COOLDOWN_STEPS_DAYS";
    let Some(raw) = optional(lookup, KEY) else {
        return Ok(CooldownTiers::default());
    };

    let invalid = |reason: String| ConfigError::Invalid {
        key: KEY,
        value: raw.clone(),
        reason,
    };
    let days = raw
        .split(',')
        .map(|d| d.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if days.iter().any(|d| *d > MAX_DAYS) {
        return Err(invalid(format!("tiers must be at most {MAX_DAYS} days")));
    }
    CooldownTiers::from_days(&days).map_err(invalid)
}

fn schedule(lookup: Lookup<'_>) -> Result<Option<Schedule>, ConfigError> {
    let (Some(days), Some(time)) = (
        optional(lookup, "REFRESH_INTERVAL_DAYS"),
        optional(lookup, "REFRESH_TIME"),
    ) else {
        return Ok(None);
    };

    let interval_days = days.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key: "REFRESH_INTERVAL_DAYS",
        value: days.clone(),
        reason: e.to_string(),
    })?;
    let time_of_day =
        NaiveTime::parse_from_str(&time, "%H:%M").map_err(|e| ConfigError::Invalid {
            key: "REFRESH_TIME",
            value: time.clone(),
            reason: e.to_string(),
        })?;

    Ok(Some(Schedule {
        interval_days,
        time_of_day,
    }))
}

fn notifications(lookup: Lookup<'_>) -> Result<NotificationConfig, ConfigError> {
    let discord_webhook = if flag(lookup, "ENABLE_DISCORD_NOTIFY")? {
        Some(required(lookup, "DISCORD_WEBHOOK_URL")?)
    } else {
        None
    };

    let telegram = if flag(lookup, "ENABLE_TELEGRAM_NOTIFY")? {
        Some(TelegramConfig {
            bot_token: required(lookup, "TELEGRAM_BOT_TOKEN")?,
            chat_id: required(lookup, "TELEGRAM_CHAT_ID")?,
        })
    } else {
        None
    };

    Ok(NotificationConfig {
        discord_webhook,
        telegram,
    })
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let log_dir = PathBuf::from(optional(lookup, "LOG_DIR").unwrap_or_else(|| "./logs".to_string()));
        let database_path = optional(lookup, "REFRESH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| log_dir.join("refresh_state.db"));
        let health_file = optional(lookup, "HEALTH_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| log_dir.join("health"));

        let excluded_libraries = optional(lookup, "EXCLUDED_LIBRARIES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let resolver_threshold: f64 =
            parsed(lookup, "RESOLVER_SCORE_THRESHOLD", defaults.resolver_threshold)?;
        if !(0.0..1.0).contains(&resolver_threshold) {
            return Err(ConfigError::Invalid {
                key: "RESOLVER_SCORE_THRESHOLD",
                value: resolver_threshold.to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }

        let engine = EngineConfig {
            chunk_size: positive(
                "SCAN_CHUNK_SIZE",
                parsed(lookup, "SCAN_CHUNK_SIZE", defaults.chunk_size)?,
            )?,
            time_budget: Duration::from_secs(at_most(
                "SCAN_TIME_LIMIT_SECONDS",
                positive(
                    "SCAN_TIME_LIMIT_SECONDS",
                    parsed(lookup, "SCAN_TIME_LIMIT_SECONDS", defaults.time_budget.as_secs())?,
                )?,
                MAX_TIME_BUDGET_SECS,
            )?),
            item_quota: positive(
                "MAX_ITEMS_PER_RUN",
                parsed(lookup, "MAX_ITEMS_PER_RUN", defaults.item_quota)?,
            )?,
            cooldown_tiers: cooldown_tiers(lookup)?,
            dead_threshold: positive(
                "MAX_FAILS",
                parsed(lookup, "MAX_FAILS", defaults.dead_threshold)?,
            )?,
            excluded_libraries,
            lookback: days(
                "SMART_LOOKBACK_DAYS",
                parsed(lookup, "SMART_LOOKBACK_DAYS", defaults.lookback.num_days())?,
            )?,
            resolver_threshold,
            pool_size: positive(
                "STATE_POOL_SIZE",
                parsed(lookup, "STATE_POOL_SIZE", defaults.pool_size)?,
            )?,
            library_concurrency: positive(
                "LIBRARY_CONCURRENCY",
                parsed(lookup, "LIBRARY_CONCURRENCY", defaults.library_concurrency)?,
            )?,
            offline_retries: parsed(lookup, "PLEX_OFFLINE_RETRIES", defaults.offline_retries)?,
            boot_grace: Duration::from_secs(parsed(
                lookup,
                "PLEX_BOOT_GRACE_SECONDS",
                defaults.boot_grace.as_secs(),
            )?),
            busy_poll_interval: Duration::from_secs(positive(
                "PLEX_SCAN_CHECK_INTERVAL",
                parsed(
                    lookup,
                    "PLEX_SCAN_CHECK_INTERVAL",
                    defaults.busy_poll_interval.as_secs(),
                )?,
            )?),
            refresh_settle: Duration::from_millis(parsed(
                lookup,
                "REFRESH_SETTLE_MS",
                defaults.refresh_settle.as_millis() as u64,
            )?),
            sample_interval: defaults.sample_interval,
            sample_window: defaults.sample_window,
        };

        let plex_url = required(lookup, "PLEX_URL")?;
        url::Url::parse(&plex_url).map_err(|e| ConfigError::Invalid {
            key: "PLEX_URL",
            value: plex_url.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            plex_url: plex_url.trim_end_matches('/').to_string(),
            plex_token: required(lookup, "PLEX_TOKEN")?,
            plex_timeout: Duration::from_secs(positive(
                "PLEX_TIMEOUT",
                parsed(lookup, "PLEX_TIMEOUT", 30u64)?,
            )?),
            tmdb_api_key: required(lookup, "TMDB_API_KEY")?,
            log_dir,
            database_path,
            health_file,
            schedule: schedule(lookup)?,
            notifications: notifications(lookup)?,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ItemKind;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&|key| map.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("PLEX_URL", "http://plex:32400"),
        ("PLEX_TOKEN", "token"),
        ("TMDB_API_KEY", "key"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.engine.chunk_size, 500);
        assert_eq!(config.engine.item_quota, 200);
        assert_eq!(config.engine.time_budget, Duration::from_secs(600));
        assert_eq!(config.engine.dead_threshold, 5);
        assert_eq!(config.engine.pool_size, 3);
        assert_eq!(config.engine.cooldown_tiers, CooldownTiers::default());
        assert_eq!(config.database_path, PathBuf::from("./logs/refresh_state.db"));
        assert!(config.schedule.is_none());
        assert!(config.notifications.discord_webhook.is_none());
    }

    #[test]
    fn test_missing_credentials() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("PLEX_URL")));
        assert_matches!(
            load(&[("PLEX_URL", "http://plex"), ("PLEX_TOKEN", " ")]),
            Err(ConfigError::Missing("PLEX_TOKEN"))
        );
    }

    #[test]
    fn test_invalid_values() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("COOLDOWN_STEPS_DAYS", "7,1"));
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid {
                key: "COOLDOWN_STEPS_DAYS",
                ..
            })
        );

        let mut vars = REQUIRED.to_vec();
        vars.push(("SCAN_CHUNK_SIZE", "0"));
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid {
                key: "SCAN_CHUNK_SIZE",
                ..
            })
        );

        let mut vars = REQUIRED.to_vec();
        vars[0] = ("PLEX_URL", "plex.local");
        assert_matches!(load(&vars), Err(ConfigError::Invalid { key: "PLEX_URL", .. }));

        let mut vars = REQUIRED.to_vec();
        vars.push(("ENABLE_DISCORD_NOTIFY", "true"));
        assert_matches!(load(&vars), Err(ConfigError::Missing("DISCORD_WEBHOOK_URL")));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        for (key, value) in [
            ("SMART_LOOKBACK_DAYS", "9223372036854775807"),
            ("SMART_LOOKBACK_DAYS", "-3"),
            ("COOLDOWN_STEPS_DAYS", "1,7,100000000"),
            ("SCAN_TIME_LIMIT_SECONDS", "18446744073709551615"),
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((key, value));
            let err = load(&vars).unwrap_err();
            assert_matches!(err, ConfigError::Invalid { key: k, .. } if k == key);
        }

        let mut vars = REQUIRED.to_vec();
        vars.push(("SMART_LOOKBACK_DAYS", "3650"));
        assert_eq!(load(&vars).unwrap().engine.lookback, TimeDelta::days(3650));
    }

    #[test]
    fn test_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("COOLDOWN_STEPS_DAYS", "2, 4"),
            ("EXCLUDED_LIBRARIES", "Kids, 7"),
            ("REFRESH_INTERVAL_DAYS", "3"),
            ("REFRESH_TIME", "04:30"),
            ("LIBRARY_CONCURRENCY", "8"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(
            config.engine.cooldown_tiers,
            CooldownTiers::from_days(&[2, 4]).unwrap()
        );
        assert_eq!(config.engine.effective_concurrency(), 3);

        let kids = Library {
            id: "12".to_string(),
            title: "kids".to_string(),
            kind: ItemKind::Movie,
        };
        let seven = Library {
            id: "7".to_string(),
            title: "Movies".to_string(),
            kind: ItemKind::Movie,
        };
        assert!(config.engine.is_excluded(&kids));
        assert!(config.engine.is_excluded(&seven));

        let schedule = config.schedule.unwrap();
        assert_eq!(schedule.interval_days, 3);
        assert_eq!(schedule.time_of_day, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
    }

    #[test]
    fn test_schedule_next_after() {
        let schedule = Schedule {
            interval_days: 2,
            time_of_day: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        };
        let now = NaiveDateTime::parse_from_str("2024-05-01 03:00", "%Y-%m-%d %H:%M").unwrap();
        assert_eq!(
            schedule.next_after(now),
            NaiveDateTime::parse_from_str("2024-05-01 04:00", "%Y-%m-%d %H:%M").unwrap()
        );

        let later = NaiveDateTime::parse_from_str("2024-05-01 05:00", "%Y-%m-%d %H:%M").unwrap();
        assert_eq!(
            schedule.next_after(later),
            NaiveDateTime::parse_from_str("2024-05-03 04:00", "%Y-%m-%d %H:%M").unwrap()
        );
    }
}
