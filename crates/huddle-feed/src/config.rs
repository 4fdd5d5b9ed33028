use std::time::Duration;

use crate::error::FeedError;

/// Tunables for a [`crate::ChannelFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// How long a cache entry stays usable after its last write.
    pub cache_ttl: Duration,
    /// Most-recent message count fetched per channel.
    pub fetch_limit: usize,
    /// Interval of the stale optimistic-row sweep.
    pub sweep_interval: Duration,
    /// Age after which an unconfirmed send is dropped by the sweep.
    pub pending_grace: Duration,
    /// Window for matching a confirmed row to a temp row by author and
    /// creation time, used when the backend does not echo client tokens.
    pub match_window: Duration,
    /// Send a client token with each insert. Only for backends whose
    /// `messages` table has a `client_token` column; others reject the
    /// unknown field, so this is off by default.
    pub send_client_tokens: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            fetch_limit: 50,
            sweep_interval: Duration::from_secs(10),
            pending_grace: Duration::from_secs(10),
            match_window: Duration::from_secs(5),
            send_client_tokens: false,
        }
    }
}

impl FeedConfig {
    /// Read overrides from `HUDDLE_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, FeedError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`FeedConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FeedError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration, FeedError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| FeedError::Config(format!("{}={:?}: {}", key, raw, e))),
                None => Ok(default),
            }
        };

        let fetch_limit = match lookup("HUDDLE_FETCH_LIMIT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| FeedError::Config(format!("HUDDLE_FETCH_LIMIT={:?}: {}", raw, e)))?,
            None => defaults.fetch_limit,
        };
        if fetch_limit == 0 {
            return Err(FeedError::Config("HUDDLE_FETCH_LIMIT must be positive".into()));
        }

        let send_client_tokens = match lookup("HUDDLE_CLIENT_TOKENS").as_deref().map(str::trim) {
            None => defaults.send_client_tokens,
            Some("1" | "true" | "on") => true,
            Some("0" | "false" | "off") => false,
            Some(other) => {
                return Err(FeedError::Config(format!("HUDDLE_CLIENT_TOKENS={:?}: expected true or false", other)));
            }
        };

        let config = Self {
            cache_ttl: secs("HUDDLE_CACHE_TTL_SECS", defaults.cache_ttl)?,
            fetch_limit,
            sweep_interval: secs("HUDDLE_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            pending_grace: secs("HUDDLE_PENDING_GRACE_SECS", defaults.pending_grace)?,
            match_window: secs("HUDDLE_MATCH_WINDOW_SECS", defaults.match_window)?,
            send_client_tokens,
        };

        if config.sweep_interval.is_zero() {
            return Err(FeedError::Config("HUDDLE_SWEEP_INTERVAL_SECS must be positive".into()));
        }

        Ok(config)
    }
}
