//! Dealership Management System adapters
//!
//! A sealed capability set over three variants: a network-free mock, an
//! OAuth2 provider (A), and an HMAC-signed provider (B). Each variant owns
//! its authentication state and a local sliding-window rate limiter; the
//! orchestrator additionally wraps every call with the DMS circuit breaker.

pub mod mock;
pub mod provider_a;
pub mod provider_b;
pub mod rate_limit;

pub use mock::MockAdapter;
pub use provider_a::ProviderAAdapter;
pub use provider_b::ProviderBAdapter;
pub use rate_limit::SlidingWindowLimiter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealership_config::{DmsAdapterKind, DmsConfig};
use dealership_core::{ServiceRecord, Vehicle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// DMS errors
#[derive(Error, Debug)]
pub enum DmsError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unreadable response: {0}")]
    InvalidResponse(String),
}

impl From<DmsError> for dealership_core::Error {
    fn from(err: DmsError) -> Self {
        match err {
            DmsError::Auth(msg) => dealership_core::Error::Auth(msg),
            DmsError::RateLimit { retry_after_secs } => dealership_core::Error::RateLimited(
                format!("dms rate limit, retry in {retry_after_secs}s"),
            ),
            DmsError::Validation(msg) => dealership_core::Error::Validation(msg),
            other => dealership_core::Error::Dms(other.to_string()),
        }
    }
}

/// Result of a bulk pricing refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSync {
    pub updated_count: usize,
    pub error_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-adapter request counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DmsStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub auth_failures: u64,
    pub rate_limit_hits: u64,
}

impl DmsStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            1.0 - self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Shared counter cell used by every adapter variant
#[derive(Debug, Default)]
pub struct StatsCell {
    total: AtomicU64,
    failed: AtomicU64,
    auth_failures: AtomicU64,
    rate_limit_hits: AtomicU64,
}

impl StatsCell {
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DmsStats {
        DmsStats {
            total_requests: self.total.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
        }
    }
}

/// Server-side filter whitelist shared by all providers
pub const FILTER_WHITELIST: [&str; 8] = [
    "make",
    "model",
    "year",
    "status",
    "category",
    "max_price",
    "min_price",
    "fuel_type",
];

/// Keep only whitelisted filters before they reach a provider
pub fn whitelist_filters(filters: Option<&HashMap<String, Value>>) -> HashMap<String, Value> {
    filters
        .map(|f| {
            f.iter()
                .filter(|(key, _)| FILTER_WHITELIST.contains(&key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Reject VINs that are not exactly 17 characters
pub fn validate_vin(vin: &str) -> Result<(), DmsError> {
    if vin.len() != 17 {
        return Err(DmsError::Validation(format!(
            "VIN must be exactly 17 characters, got {}",
            vin.len()
        )));
    }
    Ok(())
}

/// The DMS capability set
#[async_trait]
pub trait DmsAdapter: Send + Sync {
    /// Inventory listing with an optional whitelisted filter map
    async fn get_inventory(
        &self,
        filters: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Vehicle>, DmsError>;

    /// Vehicle lookup; absent VINs return `Ok(None)`
    async fn get_vehicle_details(&self, vin: &str) -> Result<Option<Vehicle>, DmsError>;

    async fn get_service_history(&self, vin: &str) -> Result<Vec<ServiceRecord>, DmsError>;

    /// `true` iff the vehicle exists and its status is `available`
    async fn check_availability(&self, vin: &str) -> Result<bool, DmsError> {
        Ok(self
            .get_vehicle_details(vin)
            .await?
            .map(|v| v.status == dealership_core::VehicleStatus::Available)
            .unwrap_or(false))
    }

    /// Free-text vehicle search with optional filters
    async fn search_vehicles(
        &self,
        query: &str,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Vehicle>, DmsError>;

    /// Bulk pricing refresh
    async fn sync_pricing(&self) -> Result<PricingSync, DmsError>;

    /// Default health probe: a one-vehicle inventory fetch
    async fn health_check(&self) -> bool {
        self.get_inventory(None, 1, 0).await.is_ok()
    }

    fn stats(&self) -> DmsStats;

    fn name(&self) -> &'static str;
}

/// Construct the adapter selected by configuration
pub fn build_adapter(config: &DmsConfig) -> Arc<dyn DmsAdapter> {
    match config.adapter {
        DmsAdapterKind::Mock => Arc::new(MockAdapter::new()),
        DmsAdapterKind::ProviderA => Arc::new(ProviderAAdapter::new(config.clone())),
        DmsAdapterKind::ProviderB => Arc::new(ProviderBAdapter::new(config.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vin_validation() {
        assert!(validate_vin("1HGCM82633A004352").is_ok());
        assert!(validate_vin("SHORT").is_err());
        assert!(validate_vin(&"X".repeat(18)).is_err());
    }

    #[test]
    fn test_filter_whitelist() {
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), Value::from("Toyota"));
        filters.insert("max_price".to_string(), Value::from(30000));
        filters.insert("dealer_secret".to_string(), Value::from("nope"));

        let allowed = whitelist_filters(Some(&filters));
        assert_eq!(allowed.len(), 2);
        assert!(!allowed.contains_key("dealer_secret"));
    }

    #[test]
    fn test_success_rate() {
        let cell = StatsCell::default();
        assert!((cell.snapshot().success_rate() - 1.0).abs() < f64::EPSILON);

        cell.record_request();
        cell.record_request();
        cell.record_failure();
        assert!((cell.snapshot().success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_build_adapter_defaults_to_mock() {
        let adapter = build_adapter(&DmsConfig::default());
        assert_eq!(adapter.name(), "mock");
    }
}
