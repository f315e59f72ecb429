//! Provider-A adapter
//!
//! OAuth2 client-credentials flow: a bearer token is obtained from
//! `POST /auth/token`, cached until five minutes before expiry, and
//! refreshed once on a 401 before the request is retried. A local
//! sliding window (1000 requests per hour) rejects before the remote
//! would.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealership_config::DmsConfig;
use dealership_core::{ServiceRecord, Vehicle, VehicleStatus};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    validate_vin, whitelist_filters, DmsAdapter, DmsError, DmsStats, PricingSync, SlidingWindowLimiter,
    StatsCell,
};

const RATE_LIMIT: usize = 1000;
const RATE_WINDOW: Duration = Duration::from_secs(3600);
/// Refresh margin before token expiry
const TOKEN_MARGIN: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct BearerToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// OAuth2-authenticated DMS adapter
pub struct ProviderAAdapter {
    client: Client,
    config: DmsConfig,
    token: Mutex<Option<BearerToken>>,
    limiter: SlidingWindowLimiter,
    stats: StatsCell,
}

impl ProviderAAdapter {
    pub fn new(config: DmsConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config,
            token: Mutex::new(None),
            limiter: SlidingWindowLimiter::new(RATE_LIMIT, RATE_WINDOW),
            stats: StatsCell::default(),
        }
    }

    /// Obtain a fresh bearer token via client credentials
    async fn authenticate(&self) -> Result<BearerToken, DmsError> {
        let response = self
            .client
            .post(format!("{}/auth/token", self.config.api_url))
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| DmsError::Auth(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            self.stats.record_auth_failure();
            return Err(DmsError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| DmsError::Auth(format!("unreadable token response: {e}")))?;

        let ttl = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_MARGIN);
        tracing::debug!(ttl_secs = ttl.as_secs(), "provider-a token refreshed");

        Ok(BearerToken {
            access_token: parsed.access_token,
            expires_at: Instant::now() + ttl,
        })
    }

    async fn bearer(&self, force_refresh: bool) -> Result<String, DmsError> {
        let mut guard = self.token.lock().await;
        let expired = guard
            .as_ref()
            .map(|t| t.expires_at <= Instant::now())
            .unwrap_or(true);

        if force_refresh || expired {
            *guard = Some(self.authenticate().await?);
        }
        Ok(guard.as_ref().map(|t| t.access_token.clone()).unwrap_or_default())
    }

    /// Authenticated request with local rate limiting, one re-auth on 401,
    /// Retry-After handling on 429, and exponential backoff otherwise.
    async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        allow_404: bool,
    ) -> Result<Option<Value>, DmsError> {
        if let Err(retry_after) = self.limiter.try_acquire() {
            self.stats.record_rate_limit_hit();
            return Err(DmsError::RateLimit {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        self.stats.record_request();
        let url = format!("{}/{}", self.config.api_url, endpoint);
        let mut reauthenticated = false;
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            let token = self.bearer(false).await?;
            let response = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await;

            match response {
                Ok(response) => match response.status() {
                    status if status.is_success() => {
                        let parsed = response
                            .json::<Value>()
                            .await
                            .map_err(|e| DmsError::InvalidResponse(e.to_string()))?;
                        return Ok(Some(parsed));
                    }
                    StatusCode::NOT_FOUND if allow_404 => return Ok(None),
                    StatusCode::UNAUTHORIZED => {
                        self.stats.record_auth_failure();
                        if reauthenticated {
                            self.stats.record_failure();
                            return Err(DmsError::Auth(
                                "still unauthorized after re-authentication".to_string(),
                            ));
                        }
                        tracing::warn!(endpoint, "got 401, re-authenticating once");
                        reauthenticated = true;
                        self.bearer(true).await?;
                        continue;
                    }
                    StatusCode::TOO_MANY_REQUESTS => {
                        let retry_after = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        if attempt + 1 < MAX_ATTEMPTS {
                            tracing::warn!(retry_after, "remote rate limit, honoring Retry-After");
                            tokio::time::sleep(Duration::from_secs(retry_after)).await;
                            continue;
                        }
                        self.stats.record_failure();
                        return Err(DmsError::RateLimit {
                            retry_after_secs: retry_after,
                        });
                    }
                    status => {
                        last_error = Some(DmsError::Request(format!(
                            "{endpoint} returned {status}"
                        )));
                    }
                },
                Err(e) => {
                    last_error = Some(DmsError::Request(format!("{endpoint} failed: {e}")));
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }

        self.stats.record_failure();
        Err(last_error.unwrap_or_else(|| DmsError::Request("request failed".to_string())))
    }

    fn filter_query(filters: Option<&HashMap<String, Value>>) -> Vec<(String, String)> {
        whitelist_filters(filters)
            .into_iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, rendered)
            })
            .collect()
    }
}

#[async_trait]
impl DmsAdapter for ProviderAAdapter {
    async fn get_inventory(
        &self,
        filters: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Vehicle>, DmsError> {
        let mut query = vec![
            ("dealerId".to_string(), self.config.dealer_code.clone()),
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        query.extend(Self::filter_query(filters));

        let response = self
            .request_json(Method::GET, "inventory", &query, false)
            .await?
            .unwrap_or_default();

        Ok(parse_vehicles(response.get("vehicles")))
    }

    async fn get_vehicle_details(&self, vin: &str) -> Result<Option<Vehicle>, DmsError> {
        validate_vin(vin)?;
        let query = vec![("dealerId".to_string(), self.config.dealer_code.clone())];

        let response = self
            .request_json(Method::GET, &format!("inventory/vehicle/{vin}"), &query, true)
            .await?;

        Ok(response.as_ref().and_then(parse_vehicle))
    }

    async fn get_service_history(&self, vin: &str) -> Result<Vec<ServiceRecord>, DmsError> {
        validate_vin(vin)?;
        let query = vec![("dealerId".to_string(), self.config.dealer_code.clone())];

        let response = self
            .request_json(Method::GET, &format!("service/history/{vin}"), &query, true)
            .await?
            .unwrap_or_default();

        Ok(parse_service_records(response.get("serviceRecords")))
    }

    async fn search_vehicles(
        &self,
        query_text: &str,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Vehicle>, DmsError> {
        let mut query = vec![
            ("dealerId".to_string(), self.config.dealer_code.clone()),
            ("q".to_string(), query_text.to_string()),
        ];
        query.extend(Self::filter_query(filters));

        let response = self
            .request_json(Method::GET, "inventory/search", &query, false)
            .await?
            .unwrap_or_default();

        Ok(parse_vehicles(response.get("results")))
    }

    async fn sync_pricing(&self) -> Result<PricingSync, DmsError> {
        let query = vec![("dealerId".to_string(), self.config.dealer_code.clone())];
        let response = self
            .request_json(Method::POST, "pricing/sync", &query, false)
            .await?
            .unwrap_or_default();

        Ok(PricingSync {
            updated_count: response
                .get("updatedCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            error_count: response
                .get("errorCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            timestamp: response
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        })
    }

    fn stats(&self) -> DmsStats {
        self.stats.snapshot()
    }

    fn name(&self) -> &'static str {
        "provider-a"
    }
}

fn parse_vehicles(value: Option<&Value>) -> Vec<Vehicle> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_vehicle).collect())
        .unwrap_or_default()
}

/// Map the provider's wire format onto the shared Vehicle view
fn parse_vehicle(data: &Value) -> Option<Vehicle> {
    let vin = data.get("vin")?.as_str()?.to_string();
    Some(Vehicle {
        vin,
        make: str_field(data, "make"),
        model: str_field(data, "model"),
        year: data.get("year").and_then(Value::as_i64).unwrap_or(0) as i32,
        trim: str_field(data, "trim"),
        color_exterior: opt_str_field(data, "exteriorColor"),
        color_interior: opt_str_field(data, "interiorColor"),
        mileage: data.get("mileage").and_then(Value::as_u64).map(|m| m as u32),
        price: data.get("price").and_then(Value::as_f64),
        status: map_status(&str_field(data, "status")),
        category: None,
        fuel_type: opt_str_field(data, "fuelType"),
        transmission: opt_str_field(data, "transmission"),
        engine: opt_str_field(data, "engine"),
        features: data
            .get("features")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        dealer_id: opt_str_field(data, "dealerId"),
        stock_number: opt_str_field(data, "stockNumber"),
        updated_at: data
            .get("updatedAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
    })
}

fn parse_service_records(value: Option<&Value>) -> Vec<ServiceRecord> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|record| {
                    Some(ServiceRecord {
                        service_date: record
                            .get("serviceDate")
                            .and_then(Value::as_str)
                            .and_then(parse_timestamp)?,
                        service_type: str_field(record, "serviceType"),
                        mileage_at_service: record
                            .get("mileageAtService")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32,
                        cost: record.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
                        notes: opt_str_field(record, "notes"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn map_status(raw: &str) -> VehicleStatus {
    match raw.to_uppercase().as_str() {
        "SOLD" => VehicleStatus::Sold,
        "PENDING_SALE" | "RESERVED" => VehicleStatus::Reserved,
        "IN_TRANSIT" => VehicleStatus::InTransit,
        "IN_SERVICE" => VehicleStatus::Service,
        _ => VehicleStatus::Available,
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vehicle_wire_mapping() {
        let wire = json!({
            "vin": "1HGCM82633A004352",
            "make": "Toyota",
            "model": "Camry",
            "year": 2024,
            "trim": "LE",
            "exteriorColor": "Silver",
            "mileage": 12,
            "price": 28000.0,
            "status": "IN_STOCK",
            "fuelType": "Gasoline",
            "features": ["Backup Camera"],
            "stockNumber": "STK1001",
            "updatedAt": "2025-06-01T12:00:00Z"
        });

        let vehicle = parse_vehicle(&wire).unwrap();
        assert_eq!(vehicle.vin, "1HGCM82633A004352");
        assert_eq!(vehicle.status, VehicleStatus::Available);
        assert_eq!(vehicle.price, Some(28000.0));
        assert_eq!(vehicle.features, vec!["Backup Camera"]);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("IN_STOCK"), VehicleStatus::Available);
        assert_eq!(map_status("sold"), VehicleStatus::Sold);
        assert_eq!(map_status("PENDING_SALE"), VehicleStatus::Reserved);
        assert_eq!(map_status("IN_SERVICE"), VehicleStatus::Service);
        assert_eq!(map_status("mystery"), VehicleStatus::Available);
    }

    #[test]
    fn test_vehicle_without_vin_dropped() {
        assert!(parse_vehicle(&json!({"make": "Toyota"})).is_none());
    }

    #[test]
    fn test_service_record_parsing() {
        let records = parse_service_records(Some(&json!([
            {"serviceDate": "2025-01-15T09:00:00Z", "serviceType": "Oil Change", "mileageAtService": 12000, "cost": 89.5}
        ])));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].service_type, "Oil Change");
    }

    #[tokio::test]
    async fn test_local_rate_limit_rejects_before_network() {
        let adapter = ProviderAAdapter::new(DmsConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        });

        // Exhaust the window without touching the (unreachable) remote
        for _ in 0..RATE_LIMIT {
            let _ = adapter.limiter.try_acquire();
        }

        let err = adapter.get_inventory(None, 1, 0).await;
        assert!(matches!(err, Err(DmsError::RateLimit { .. })));
        assert_eq!(adapter.stats().rate_limit_hits, 1);
    }
}
