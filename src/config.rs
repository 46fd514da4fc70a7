use serde::Deserialize;
use url::Url;

/// Service configuration, loaded from `HOOKLINE_`-prefixed environment
/// variables. Every tunable has an accessor with a built-in default so
/// deployments only set what they need.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub listen_addr: Option<String>,

    /// Shared secret expected in the `x-api-secret` header on every route.
    pub api_secret: String,

    /// Base URL for the default dispatch target. When unset, messages are
    /// dispatched back to this service's own trigger endpoints.
    pub dispatch_url: Option<Url>,
    /// Base URL for `function_type = "worker"` messages. When unset, worker
    /// messages fail with a no-target outcome rather than routing to the
    /// default target.
    pub worker_dispatch_url: Option<Url>,

    pub batch_size: Option<u32>,
    pub visibility_timeout_secs: Option<u32>,
    pub dispatch_timeout_secs: Option<u64>,

    pub delivery_timeout_secs: Option<u64>,
    pub delivery_max_attempts: Option<u32>,
    pub retry_base_secs: Option<i64>,
    pub retry_max_secs: Option<i64>,
    pub retry_jitter_secs: Option<i64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("HOOKLINE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("hookline.db")
    }

    pub fn listen_addr(&self) -> &str {
        self.listen_addr
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("127.0.0.1:8080")
    }

    /// Messages claimed per consumer invocation.
    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(200)
    }

    /// Window during which a claimed message stays hidden from other readers.
    pub fn visibility_timeout_secs(&self) -> u32 {
        self.visibility_timeout_secs.unwrap_or(60)
    }

    /// Hard deadline for one queue-dispatched function call.
    pub fn dispatch_timeout_secs(&self) -> u64 {
        self.dispatch_timeout_secs.unwrap_or(5)
    }

    /// Hard deadline for the final subscriber HTTP call.
    pub fn delivery_timeout_secs(&self) -> u64 {
        self.delivery_timeout_secs.unwrap_or(10)
    }

    pub fn delivery_max_attempts(&self) -> u32 {
        self.delivery_max_attempts.unwrap_or(3)
    }

    pub fn retry_base_secs(&self) -> i64 {
        self.retry_base_secs.unwrap_or(60)
    }

    pub fn retry_max_secs(&self) -> i64 {
        self.retry_max_secs.unwrap_or(3600)
    }

    pub fn retry_jitter_secs(&self) -> i64 {
        self.retry_jitter_secs.unwrap_or(0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            listen_addr: None,
            api_secret: "dev-secret".to_owned(),
            dispatch_url: None,
            worker_dispatch_url: None,
            batch_size: None,
            visibility_timeout_secs: None,
            dispatch_timeout_secs: None,
            delivery_timeout_secs: None,
            delivery_max_attempts: None,
            retry_base_secs: None,
            retry_max_secs: None,
            retry_jitter_secs: None,
        }
    }
}
