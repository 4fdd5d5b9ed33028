use url::Url;

use crate::error::ClientError;

/// Connection settings for the hosted backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Project base url, e.g. `https://abc.example.co`.
    pub url: Url,
    /// Public project key, sent as `apikey` on every request.
    pub api_key: String,
    /// Session token of the signed-in user. Without it requests run with
    /// the project key and nobody is signed in.
    pub access_token: Option<String>,
}

impl ClientConfig {
    pub fn new(url: &str, api_key: &str, access_token: Option<&str>) -> Result<Self, ClientError> {
        let url = Url::parse(url.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Scheme(url.scheme().to_string()));
        }

        Ok(Self {
            url,
            api_key: api_key.trim().to_string(),
            access_token: access_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    /// Read `HUDDLE_URL`, `HUDDLE_API_KEY` and the optional `HUDDLE_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("HUDDLE_URL").ok_or(ClientError::MissingVar("HUDDLE_URL"))?;
        let api_key = lookup("HUDDLE_API_KEY").ok_or(ClientError::MissingVar("HUDDLE_API_KEY"))?;
        let access_token = lookup("HUDDLE_ACCESS_TOKEN");
        Self::new(&url, &api_key, access_token.as_deref())
    }

    /// Base url without a trailing slash.
    pub(crate) fn base(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    /// Token for the `Authorization` header.
    pub(crate) fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}
