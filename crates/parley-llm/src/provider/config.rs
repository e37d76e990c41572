use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider ID
    pub provider_id: String,
    /// Base URL for the API
    pub base_url: String,
    /// Bearer API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Default model to use
    pub model: String,
    /// Request timeout in seconds
    #[serde(with = "serde_duration", default = "default_timeout")]
    pub timeout: Duration,
    /// Additional headers to include
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ProviderConfig {
    /// Create a new provider config
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: default_timeout(),
            headers: HashMap::new(),
        }
    }

    /// OpenRouter defaults with the app attribution headers it expects
    pub fn openrouter(app_title: impl Into<String>, app_referer: impl Into<String>) -> Self {
        Self::new("openrouter", OPENROUTER_BASE_URL)
            .with_header("X-Title", app_title)
            .with_header("HTTP-Referer", app_referer)
    }

    /// Set API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new("openrouter", OPENROUTER_BASE_URL)
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

// Custom serialization for Duration
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
