use minute_flow::{
    feed::connector::DEFAULT_FEED_URL,
    feed::timeout::DEFAULT_FEED_READ_TIMEOUT,
    pipeline::{QueueConfig, WriterConfig},
    scheduler::ScheduleSpec,
    supervisor::SupervisorConfig,
};
use smol_str::SmolStr;
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: SmolStr,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub url: Url,
    pub schedule: ScheduleSpec,
}

/// Process configuration read from `MINUTE_FLOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub feed_url: Url,
    pub read_timeout: Duration,
    pub instruments_path: PathBuf,
    pub tokens_path: PathBuf,
    pub sink_path: PathBuf,
    pub autostart: bool,
    pub supervisor: SupervisorConfig,
    pub reconcile: ScheduleSpec,
    pub refresh: Option<RefreshConfig>,
    pub telegram: Option<TelegramConfig>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let queue = QueueConfig::default()
            .with_capacity(env.parse("MINUTE_FLOW_QUEUE_CAPACITY", 50_000)?)
            .with_notify_every(env.parse("MINUTE_FLOW_QUEUE_NOTIFY_EVERY", 1_000)?);

        let writer = WriterConfig::default()
            .with_batch_size(env.parse("MINUTE_FLOW_BATCH_SIZE", 2_000)?)
            .with_flush_interval(Duration::from_millis(
                env.parse("MINUTE_FLOW_FLUSH_INTERVAL_MS", 3_000)?,
            ));

        let supervisor = SupervisorConfig::default()
            .with_token_owner(env.string("MINUTE_FLOW_TOKEN_OWNER", "default"))
            .with_max_retries(env.parse("MINUTE_FLOW_MAX_RETRIES", 3)?)
            .with_base_backoff(Duration::from_secs(
                env.parse("MINUTE_FLOW_BASE_BACKOFF_SECS", 5)?,
            ))
            .with_archive_ticks(env.parse("MINUTE_FLOW_ARCHIVE_TICKS", true)?)
            .with_queue(queue)
            .with_writer(writer);

        let reconcile = env.schedule(
            "MINUTE_FLOW_RECONCILE_INTERVAL_MIN",
            30,
            "MINUTE_FLOW_RECONCILE_SECOND",
            0,
        )?;

        let refresh = match lookup("MINUTE_FLOW_REFRESH_URL") {
            Some(raw) => Some(RefreshConfig {
                url: parse_url("MINUTE_FLOW_REFRESH_URL", &raw)?,
                schedule: env.schedule(
                    "MINUTE_FLOW_REFRESH_INTERVAL_MIN",
                    5,
                    "MINUTE_FLOW_REFRESH_SECOND",
                    10,
                )?,
            }),
            None => None,
        };

        let telegram = match (
            lookup("MINUTE_FLOW_TELEGRAM_BOT_TOKEN"),
            lookup("MINUTE_FLOW_TELEGRAM_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                bot_token,
                chat_id: SmolStr::new(chat_id),
            }),
            _ => None,
        };

        Ok(Self {
            feed_url: parse_url(
                "MINUTE_FLOW_FEED_URL",
                &env.string("MINUTE_FLOW_FEED_URL", DEFAULT_FEED_URL),
            )?,
            read_timeout: Duration::from_secs(env.parse(
                "MINUTE_FLOW_READ_TIMEOUT_SECS",
                DEFAULT_FEED_READ_TIMEOUT.as_secs(),
            )?),
            instruments_path: env.string("MINUTE_FLOW_INSTRUMENTS", "instruments.json").into(),
            tokens_path: env.string("MINUTE_FLOW_TOKENS", "tokens.json").into(),
            sink_path: env.string("MINUTE_FLOW_SINK", "aggregates.jsonl").into(),
            autostart: env.parse("MINUTE_FLOW_AUTOSTART", true)?,
            supervisor,
            reconcile,
            refresh,
            telegram,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.0)(key) {
            Some(value) => value.trim().parse().map_err(|error: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: error.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn schedule(
        &self,
        interval_key: &'static str,
        interval_default: u32,
        second_key: &'static str,
        second_default: u32,
    ) -> Result<ScheduleSpec, ConfigError> {
        let interval = self.parse(interval_key, interval_default)?;
        let second = self.parse(second_key, second_default)?;

        ScheduleSpec::new(interval, second).map_err(|error| ConfigError::Invalid {
            key: interval_key,
            value: format!("{interval}m at second {second}"),
            reason: error.to_string(),
        })
    }
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|error| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: error.to_string(),
    })
}
