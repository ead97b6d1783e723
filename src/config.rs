use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::cache::ReadMode;
use crate::model::LessonKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Hourly rates in cents, per lesson kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub private_hourly: u64,
    pub pair_hourly: u64,
    pub group_hourly: u64,
    pub recurring_hourly: u64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            private_hourly: 4_000,
            pair_hourly: 3_000,
            group_hourly: 2_000,
            recurring_hourly: 3_600,
        }
    }
}

impl Pricing {
    pub fn hourly(&self, kind: LessonKind) -> u64 {
        match kind {
            LessonKind::Private => self.private_hourly,
            LessonKind::Pair => self.pair_hourly,
            LessonKind::Group => self.group_hourly,
            LessonKind::RecurringInstance => self.recurring_hourly,
        }
    }

    /// Price of one lesson record, rounded to the nearest cent.
    pub fn price(&self, kind: LessonKind, duration_min: u32) -> u64 {
        (self.hourly(kind) * duration_min as u64 + 30) / 60
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Teacher substituted for slots that carry none. `None` rejects such slots.
    pub default_teacher: Option<Ulid>,
    pub lessons_ttl: Duration,
    pub slots_ttl: Duration,
    pub read_mode: ReadMode,
    pub advisory_debounce: Duration,
    pub pricing: Pricing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_teacher: None,
            lessons_ttl: Duration::from_secs(60),
            slots_ttl: Duration::from_secs(60),
            read_mode: ReadMode::Fresh,
            advisory_debounce: Duration::from_millis(500),
            pricing: Pricing::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Keep a durable tier under the data directory.
    pub durable: bool,
    pub durable_capacity_bytes: u64,
    /// How long past expiry an entry is kept as a stale fallback.
    pub max_stale: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            durable: true,
            durable_capacity_bytes: 64 * 1024 * 1024,
            max_stale: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub notify_enabled: bool,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        fn parse<T: FromStr>(name: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
            raw.map(|v| {
                v.trim().parse().map_err(|_| ConfigError::Invalid { var: name, value: v.clone() })
            })
            .transpose()
        }
        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse::<u64>(name, var(name))?.map_or(default, Duration::from_secs))
        };
        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse::<u64>(name, var(name))?.map_or(default, Duration::from_millis))
        };
        let flag = |name: &'static str, default: bool| -> Result<bool, ConfigError> {
            match var(name) {
                None => Ok(default),
                Some(v) => match v.trim().to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => Err(ConfigError::Invalid { var: name, value: v }),
                },
            }
        };

        let engine_defaults = EngineConfig::default();
        let cache_defaults = CacheConfig::default();
        let price_defaults = Pricing::default();

        let default_teacher = match var("SLOTBOOK_DEFAULT_TEACHER") {
            None => None,
            Some(v) => Some(Ulid::from_string(v.trim()).map_err(|_| ConfigError::Invalid {
                var: "SLOTBOOK_DEFAULT_TEACHER",
                value: v.clone(),
            })?),
        };
        let read_mode = if flag("SLOTBOOK_CACHE_SWR", false)? {
            ReadMode::StaleWhileRevalidate
        } else {
            ReadMode::Fresh
        };

        Ok(Self {
            bind: var("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse("SLOTBOOK_PORT", var("SLOTBOOK_PORT"))?.unwrap_or(5433),
            data_dir: PathBuf::from(var("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: var("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parse("SLOTBOOK_MAX_CONNECTIONS", var("SLOTBOOK_MAX_CONNECTIONS"))?.unwrap_or(256),
            compact_threshold: parse("SLOTBOOK_COMPACT_THRESHOLD", var("SLOTBOOK_COMPACT_THRESHOLD"))?
                .unwrap_or(1000),
            tls_cert: var("SLOTBOOK_TLS_CERT"),
            tls_key: var("SLOTBOOK_TLS_KEY"),
            metrics_port: parse("SLOTBOOK_METRICS_PORT", var("SLOTBOOK_METRICS_PORT"))?,
            notify_enabled: flag("SLOTBOOK_NOTIFY", true)?,
            engine: EngineConfig {
                default_teacher,
                lessons_ttl: secs("SLOTBOOK_LESSONS_TTL_SECS", engine_defaults.lessons_ttl)?,
                slots_ttl: secs("SLOTBOOK_SLOTS_TTL_SECS", engine_defaults.slots_ttl)?,
                read_mode,
                advisory_debounce: millis("SLOTBOOK_DEBOUNCE_MS", engine_defaults.advisory_debounce)?,
                pricing: Pricing {
                    private_hourly: parse("SLOTBOOK_PRICE_PRIVATE", var("SLOTBOOK_PRICE_PRIVATE"))?
                        .unwrap_or(price_defaults.private_hourly),
                    pair_hourly: parse("SLOTBOOK_PRICE_PAIR", var("SLOTBOOK_PRICE_PAIR"))?
                        .unwrap_or(price_defaults.pair_hourly),
                    group_hourly: parse("SLOTBOOK_PRICE_GROUP", var("SLOTBOOK_PRICE_GROUP"))?
                        .unwrap_or(price_defaults.group_hourly),
                    recurring_hourly: parse("SLOTBOOK_PRICE_RECURRING", var("SLOTBOOK_PRICE_RECURRING"))?
                        .unwrap_or(price_defaults.recurring_hourly),
                },
            },
            cache: CacheConfig {
                durable: flag("SLOTBOOK_CACHE_DURABLE", cache_defaults.durable)?,
                durable_capacity_bytes: parse("SLOTBOOK_CACHE_BYTES", var("SLOTBOOK_CACHE_BYTES"))?
                    .unwrap_or(cache_defaults.durable_capacity_bytes),
                max_stale: secs("SLOTBOOK_CACHE_MAX_STALE_SECS", cache_defaults.max_stale)?,
                sweep_interval: secs("SLOTBOOK_CACHE_SWEEP_SECS", cache_defaults.sweep_interval)?,
            },
        })
    }
}
