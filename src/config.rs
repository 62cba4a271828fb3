use crate::core::{DbError, Result};
use crate::gridfs::DEFAULT_CHUNK_SIZE_BYTES;
use serde::Deserialize;
use std::time::Duration;

/// Client configuration
///
/// Built fluently, parsed from a `mongodb://` connection string, or loaded
/// from JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reported to the store for diagnostics
    pub app_name: Option<String>,

    /// Database used by `Client::default_database`
    pub default_database: String,

    /// Batch size for cursors that do not set one
    pub default_batch_size: Option<u32>,

    /// Chunk size for new GridFS buckets
    pub chunk_size_bytes: u32,

    /// Default causal consistency of new sessions
    pub causal_consistency: bool,

    /// Upper bound on every store call
    #[serde(with = "millis")]
    pub operation_timeout: Option<Duration>,
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            app_name: None,
            default_database: "test".to_string(),
            default_batch_size: None,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            causal_consistency: true,
            operation_timeout: None,
        }
    }

    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = Some(name.to_string());
        self
    }

    pub fn default_database(mut self, database: &str) -> Self {
        self.default_database = database.to_string();
        self
    }

    pub fn default_batch_size(mut self, size: u32) -> Self {
        self.default_batch_size = Some(size);
        self
    }

    pub fn chunk_size_bytes(mut self, size: u32) -> Self {
        self.chunk_size_bytes = size;
        self
    }

    pub fn causal_consistency(mut self, enabled: bool) -> Self {
        self.causal_consistency = enabled;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Parse from a connection string
    ///
    /// Format: `mongodb://[host[:port]]/[database][?appName=..&batchSize=..&chunkSize=..&timeoutMS=..]`
    ///
    /// Host and port are accepted and ignored; topology is the store's concern.
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::ClientConfig;
    /// let config = ClientConfig::from_url("mongodb://localhost:27017/app?appName=worker").unwrap();
    /// assert_eq!(config.default_database, "app");
    /// assert_eq!(config.app_name.as_deref(), Some("worker"));
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("mongodb://")
            .ok_or_else(|| DbError::Config("URL must start with 'mongodb://'".to_string()))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut config = Self::new();
        if let Some((_, database)) = location.split_once('/') {
            if !database.is_empty() {
                config.default_database = database.to_string();
            }
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::Config(format!("Invalid option '{}'", pair)))?;
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| DbError::Config(format!("Invalid value for {}: '{}'", key, value)))
            };
            match key {
                "appName" => config.app_name = Some(value.to_string()),
                "batchSize" => config.default_batch_size = Some(narrow(key, number()?)?),
                "chunkSize" => config.chunk_size_bytes = narrow(key, number()?)?,
                "timeoutMS" => config.operation_timeout = Some(Duration::from_millis(number()?)),
                "causalConsistency" => {
                    config.causal_consistency = value
                        .parse()
                        .map_err(|_| DbError::Config(format!("Invalid value for {}: '{}'", key, value)))?
                }
                other => return Err(DbError::Config(format!("Unknown option '{}'", other))),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let mut options = Vec::new();
        if let Some(name) = &self.app_name {
            options.push(format!("appName={}", name));
        }
        if let Some(size) = self.default_batch_size {
            options.push(format!("batchSize={}", size));
        }
        if self.chunk_size_bytes != DEFAULT_CHUNK_SIZE_BYTES {
            options.push(format!("chunkSize={}", self.chunk_size_bytes));
        }
        if let Some(timeout) = self.operation_timeout {
            options.push(format!("timeoutMS={}", timeout.as_millis()));
        }

        let mut url = format!("mongodb://localhost/{}", self.default_database);
        if !options.is_empty() {
            url.push('?');
            url.push_str(&options.join("&"));
        }
        url
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_database.is_empty() {
            return Err(DbError::Config("Database name cannot be empty".to_string()));
        }

        if self.default_database.contains(['/', '\\', '.', ' ', '"', '$']) {
            return Err(DbError::Config(format!(
                "Invalid database name '{}'",
                self.default_database
            )));
        }

        if self.default_batch_size == Some(0) {
            return Err(DbError::Config("batch size must be > 0".to_string()));
        }

        if self.chunk_size_bytes == 0 {
            return Err(DbError::Config("chunk size must be > 0".to_string()));
        }

        if self.operation_timeout == Some(Duration::ZERO) {
            return Err(DbError::Config("operation timeout must be > 0".to_string()));
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn narrow(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| DbError::Config(format!("Value for {} out of range: {}", key, value)))
}
