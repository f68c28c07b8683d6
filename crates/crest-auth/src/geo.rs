//! Best-effort IP → location enrichment.
//!
//! Failures of any kind degrade to `None`; callers record "unknown". The
//! lookup must never block an auth flow for long, so the HTTP client carries
//! a short timeout.

use async_trait::async_trait;
use crest_common::config::GeoConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// Resolve an IP to a human-readable location, or `None` on any failure.
    async fn lookup(&self, ip: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    city: Option<String>,
    country: Option<String>,
}

/// HTTP lookup against an ip-api-style endpoint.
pub struct HttpGeoLookup {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGeoLookup {
    pub fn new(config: &GeoConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: &str) -> Option<String> {
        let url = format!("{}/{}", self.endpoint, ip);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(ip, error = %e, "geo lookup failed");
                return None;
            }
        };
        let geo: GeoResponse = match response.json().await {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(ip, error = %e, "geo response unparseable");
                return None;
            }
        };
        match (geo.city, geo.country) {
            (Some(city), Some(country)) => Some(format!("{city}, {country}")),
            (None, Some(country)) => Some(country),
            (Some(city), None) => Some(city),
            (None, None) => None,
        }
    }
}

/// Lookups disabled by configuration.
pub struct NoopGeoLookup;

#[async_trait]
impl GeoLookup for NoopGeoLookup {
    async fn lookup(&self, _ip: &str) -> Option<String> {
        None
    }
}

pub fn from_config(config: &GeoConfig) -> anyhow::Result<Arc<dyn GeoLookup>> {
    if config.endpoint.is_empty() {
        Ok(Arc::new(NoopGeoLookup))
    } else {
        Ok(Arc::new(HttpGeoLookup::new(config)?))
    }
}
