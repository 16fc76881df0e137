use std::time::Duration;

use crate::{IdentityError, IdentityResult};

/// Environment variable prefix read by [`IdentityConfig::from_env`].
pub const ENV_PREFIX: &str = "DOG_IDENTITY__";

/// Configuration for the identity stores and their table backend
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Name of the single table every record lives in
    pub table_name: String,

    /// Region for the DynamoDB backend; falls back to the SDK's provider chain
    pub region: Option<String>,

    /// Endpoint override, e.g. `http://localhost:8000` for DynamoDB Local
    pub endpoint_url: Option<String>,

    /// Items per page for partition queries. Pages are always followed to
    /// the end; this only bounds each request.
    pub page_size: Option<u32>,

    /// Strongly consistent reads. Projections rely on reading their own
    /// writes, so this should stay on outside of tests.
    pub consistent_read: bool,

    /// Deadline per store operation. For partition reads it covers the whole
    /// sequence of pages.
    pub request_timeout: Option<Duration>,
}

impl IdentityConfig {
    /// Create a config for `table_name` with defaults
    pub fn new<S: Into<String>>(table_name: S) -> Self {
        Self {
            table_name: table_name.into(),
            region: None,
            endpoint_url: None,
            page_size: None,
            consistent_read: true,
            request_timeout: None,
        }
    }

    /// Load from `DOG_IDENTITY__*` environment variables.
    ///
    /// `DOG_IDENTITY__TABLE_NAME` is required. The region falls back to
    /// `AWS_REGION`.
    pub fn from_env() -> IdentityResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> IdentityResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        let table_name = var("TABLE_NAME")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                IdentityError::invalid(format!("{}TABLE_NAME is not set", ENV_PREFIX))
            })?;

        let mut config = Self::new(table_name);
        config.region = var("REGION").or_else(|| lookup("AWS_REGION"));
        config.endpoint_url = var("ENDPOINT_URL");

        if let Some(raw) = var("PAGE_SIZE") {
            let size = raw
                .parse::<u32>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| {
                    IdentityError::invalid(format!("{}PAGE_SIZE: invalid value {:?}", ENV_PREFIX, raw))
                })?;
            config.page_size = Some(size);
        }

        if let Some(raw) = var("CONSISTENT_READ") {
            config.consistent_read = raw.parse::<bool>().map_err(|_| {
                IdentityError::invalid(format!(
                    "{}CONSISTENT_READ: invalid value {:?}",
                    ENV_PREFIX, raw
                ))
            })?;
        }

        if let Some(raw) = var("REQUEST_TIMEOUT_MS") {
            let ms = raw.parse::<u64>().map_err(|_| {
                IdentityError::invalid(format!(
                    "{}REQUEST_TIMEOUT_MS: invalid value {:?}",
                    ENV_PREFIX, raw
                ))
            })?;
            config.request_timeout = Some(Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Set the region
    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Point the backend at a custom endpoint
    pub fn with_endpoint_url<S: Into<String>>(mut self, url: S) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Set the per-request page size
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Use eventually consistent reads
    pub fn eventually_consistent(mut self) -> Self {
        self.consistent_read = false;
        self
    }

    /// Set the per-operation deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
