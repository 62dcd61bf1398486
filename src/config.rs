use std::{env, str::FromStr, time::Duration};

use crate::error::{AppErr, AppResult};

const MIB: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url:       String,
    pub bind_addr:          String,
    pub jwt_secret:         String,
    pub upload_dir:         String,
    pub body_limit:         usize,
    pub inactivity:         Duration,
    pub stale_participant:  Duration,
    pub message_retention:  Duration,
    pub sweep_interval:     Duration,
    pub keepalive:          Duration,
    pub token_ttl:          Duration,
    pub trust_forwarded:    bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url:      "sqlite://pin_chat.db".into(),
            bind_addr:         "0.0.0.0:3000".into(),
            jwt_secret:        "dev-secret-change-me".into(),
            upload_dir:        "static/uploads".into(),
            body_limit:        100 * MIB,
            inactivity:        Duration::from_secs(30 * 60),
            stale_participant: Duration::from_secs(24 * 60 * 60),
            message_retention: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval:    Duration::from_secs(60),
            keepalive:         Duration::from_secs(90),
            token_ttl:         Duration::from_secs(24 * 60 * 60),
            trust_forwarded:   false,
        }
    }
}

impl Config {
    /// Reads the process environment; call `dotenvy::dotenv()` first if a
    /// `.env` file should be honoured.
    pub fn from_env() -> AppResult<Self> {
        let d = Self::default();
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppErr::Config("JWT_SECRET must be set".into()))?;

        Ok(Self {
            database_url:      var_or("DATABASE_URL", d.database_url)?,
            bind_addr:         var_or("BIND_ADDR", d.bind_addr)?,
            jwt_secret,
            upload_dir:        var_or("UPLOAD_DIR", d.upload_dir)?,
            body_limit:        var_or("BODY_LIMIT", d.body_limit)?,
            inactivity:        minutes(var_or("INACTIVITY_MINUTES", 30)?),
            stale_participant: minutes(var_or("STALE_PARTICIPANT_HOURS", 24)? * 60),
            message_retention: minutes(var_or("MESSAGE_RETENTION_DAYS", 30)? * 24 * 60),
            sweep_interval:    Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", 60)?),
            keepalive:         Duration::from_secs(var_or("KEEPALIVE_SECS", 90)?),
            token_ttl:         minutes(var_or("TOKEN_TTL_HOURS", 24)? * 60),
            trust_forwarded:   var_or("TRUST_FORWARDED", false)?,
        })
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn var_or<T>(key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppErr::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
