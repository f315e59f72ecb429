//! Provider-B adapter
//!
//! Request signing: HMAC-SHA256 over `timestamp ∥ method ∥ endpoint ∥
//! dealer_code` with the API key as secret, exchanged for a session token
//! via `POST /auth/session`. Sessions refresh when five minutes or less
//! remain. A local sliding window (500 requests per 5 minutes) rejects
//! before the remote would.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dealership_config::DmsConfig;
use dealership_core::{ServiceRecord, Vehicle, VehicleStatus};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::{
    validate_vin, whitelist_filters, DmsAdapter, DmsError, DmsStats, PricingSync, SlidingWindowLimiter,
    StatsCell,
};

type HmacSha256 = Hmac<Sha256>;

const RATE_LIMIT: usize = 500;
const RATE_WINDOW: Duration = Duration::from_secs(300);
/// Refresh margin before session expiry
const SESSION_MARGIN: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// HMAC-signed DMS adapter
pub struct ProviderBAdapter {
    client: Client,
    config: DmsConfig,
    session: Mutex<Option<Session>>,
    limiter: SlidingWindowLimiter,
    stats: StatsCell,
}

impl ProviderBAdapter {
    pub fn new(config: DmsConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config,
            session: Mutex::new(None),
            limiter: SlidingWindowLimiter::new(RATE_LIMIT, RATE_WINDOW),
            stats: StatsCell::default(),
        }
    }

    /// HMAC-SHA256 over `timestamp ∥ method ∥ endpoint ∥ dealer_code`
    fn sign(&self, timestamp: &str, method: &str, endpoint: &str) -> String {
        let payload = format!("{timestamp}{method}{endpoint}{}", self.config.dealer_code);
        let mut mac = HmacSha256::new_from_slice(self.config.api_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, method: &str, endpoint: &str) -> [(String, String); 3] {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, method, endpoint);
        [
            ("X-Timestamp".to_string(), timestamp),
            ("X-Signature".to_string(), signature),
            ("X-Dealer-Code".to_string(), self.config.dealer_code.clone()),
        ]
    }

    /// Exchange a signed request for a session token
    async fn authenticate(&self) -> Result<Session, DmsError> {
        let endpoint = "/auth/session";
        let mut request = self
            .client
            .post(format!("{}{endpoint}", self.config.api_url))
            .json(&json!({ "dealer_code": self.config.dealer_code }));
        for (name, value) in self.signed_headers("POST", endpoint) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DmsError::Auth(format!("session request failed: {e}")))?;

        if !response.status().is_success() {
            self.stats.record_auth_failure();
            return Err(DmsError::Auth(format!(
                "session endpoint returned {}",
                response.status()
            )));
        }

        let parsed: SessionResponse = response
            .json()
            .await
            .map_err(|e| DmsError::Auth(format!("unreadable session response: {e}")))?;

        let ttl = Duration::from_secs(parsed.expires_in).saturating_sub(SESSION_MARGIN);
        tracing::debug!(ttl_secs = ttl.as_secs(), "provider-b session refreshed");

        Ok(Session {
            token: parsed.session_token,
            expires_at: Instant::now() + ttl,
        })
    }

    async fn session_token(&self, force_refresh: bool) -> Result<String, DmsError> {
        let mut guard = self.session.lock().await;
        let expired = guard
            .as_ref()
            .map(|s| s.expires_at <= Instant::now())
            .unwrap_or(true);

        if force_refresh || expired {
            *guard = Some(self.authenticate().await?);
        }
        Ok(guard.as_ref().map(|s| s.token.clone()).unwrap_or_default())
    }

    /// Signed, session-authenticated request with the shared retry shape
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
        let path = format!("/{endpoint}");
        let url = format!("{}{path}", self.config.api_url);
        let mut reauthenticated = false;
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            let token = self.session_token(false).await?;
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .query(query);
            for (name, value) in self.signed_headers(method.as_str(), &path) {
                request = request.header(name, value);
            }

            match request.send().await {
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
                                "still unauthorized after session refresh".to_string(),
                            ));
                        }
                        tracing::warn!(endpoint, "got 401, refreshing session once");
                        reauthenticated = true;
                        self.session_token(true).await?;
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

    /// Translate whitelisted filters into this provider's parameter names
    fn filter_query(filters: Option<&HashMap<String, Value>>) -> Vec<(String, String)> {
        whitelist_filters(filters)
            .into_iter()
            .map(|(key, value)| {
                let mapped = match key.as_str() {
                    "make" => "manufacturer".to_string(),
                    "year" => "modelYear".to_string(),
                    other => other.to_string(),
                };
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (mapped, rendered)
            })
            .collect()
    }
}

#[async_trait]
impl DmsAdapter for ProviderBAdapter {
    async fn get_inventory(
        &self,
        filters: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Vehicle>, DmsError> {
        let mut query = vec![
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        query.extend(Self::filter_query(filters));

        let response = self
            .request_json(Method::GET, "vehicles", &query, false)
            .await?
            .unwrap_or_default();

        Ok(parse_vehicles(response.get("data")))
    }

    async fn get_vehicle_details(&self, vin: &str) -> Result<Option<Vehicle>, DmsError> {
        validate_vin(vin)?;

        let response = self
            .request_json(Method::GET, &format!("vehicles/{vin}"), &[], true)
            .await?;

        Ok(response
            .as_ref()
            .and_then(|r| r.get("data"))
            .and_then(parse_vehicle))
    }

    async fn get_service_history(&self, vin: &str) -> Result<Vec<ServiceRecord>, DmsError> {
        validate_vin(vin)?;

        let response = self
            .request_json(Method::GET, &format!("service/{vin}/history"), &[], true)
            .await?
            .unwrap_or_default();

        Ok(parse_service_records(response.get("records")))
    }

    async fn search_vehicles(
        &self,
        query_text: &str,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Vehicle>, DmsError> {
        let mut query = vec![("search".to_string(), query_text.to_string())];
        query.extend(Self::filter_query(filters));

        let response = self
            .request_json(Method::GET, "vehicles/search", &query, false)
            .await?
            .unwrap_or_default();

        Ok(parse_vehicles(response.get("data")))
    }

    async fn sync_pricing(&self) -> Result<PricingSync, DmsError> {
        let response = self
            .request_json(Method::POST, "pricing/refresh", &[], false)
            .await?
            .unwrap_or_default();

        Ok(PricingSync {
            updated_count: response.get("updated").and_then(Value::as_u64).unwrap_or(0) as usize,
            error_count: response.get("errors").and_then(Value::as_u64).unwrap_or(0) as usize,
            timestamp: response
                .get("processedAt")
                .and_then(Value::as_str)
                .and_then(|raw| {
                    chrono::DateTime::parse_from_rfc3339(raw)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                })
                .unwrap_or_else(Utc::now),
        })
    }

    fn stats(&self) -> DmsStats {
        self.stats.snapshot()
    }

    fn name(&self) -> &'static str {
        "provider-b"
    }
}

fn parse_vehicles(value: Option<&Value>) -> Vec<Vehicle> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_vehicle).collect())
        .unwrap_or_default()
}

/// Map this provider's verbose wire format onto the shared Vehicle view
fn parse_vehicle(data: &Value) -> Option<Vehicle> {
    let vin = data
        .get("vehicleIdentificationNumber")?
        .as_str()?
        .to_string();

    let str_field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let opt_str = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

    Some(Vehicle {
        vin,
        make: str_field("manufacturer"),
        model: str_field("model"),
        year: data.get("modelYear").and_then(Value::as_i64).unwrap_or(0) as i32,
        trim: str_field("trimLevel"),
        color_exterior: opt_str("exteriorColorDescription"),
        color_interior: opt_str("interiorColorDescription"),
        mileage: data.get("odometer").and_then(Value::as_u64).map(|m| m as u32),
        price: data.get("retailPrice").and_then(Value::as_f64),
        status: map_status(&str_field("inventoryStatus")),
        category: None,
        fuel_type: opt_str("fuelType"),
        transmission: opt_str("transmissionDescription"),
        engine: opt_str("engineDescription"),
        features: data
            .get("optionDescriptions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        dealer_id: opt_str("dealerCode"),
        stock_number: opt_str("stockNumber"),
        updated_at: data
            .get("dateModified")
            .and_then(Value::as_str)
            .and_then(|raw| {
                chrono::DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
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
                            .get("performedAt")
                            .and_then(Value::as_str)
                            .and_then(|raw| {
                                chrono::DateTime::parse_from_rfc3339(raw)
                                    .ok()
                                    .map(|dt| dt.with_timezone(&Utc))
                            })?,
                        service_type: record
                            .get("workDescription")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        mileage_at_service: record
                            .get("odometerReading")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32,
                        cost: record
                            .get("totalCost")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                        notes: record
                            .get("technicianNotes")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn map_status(raw: &str) -> VehicleStatus {
    match raw.to_uppercase().as_str() {
        "SOLD" => VehicleStatus::Sold,
        "PENDING" | "RESERVED" => VehicleStatus::Reserved,
        "IN_TRANSIT" => VehicleStatus::InTransit,
        "SERVICE" | "WORKSHOP" => VehicleStatus::Service,
        _ => VehicleStatus::Available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> ProviderBAdapter {
        ProviderBAdapter::new(DmsConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            api_key: "secret-key".to_string(),
            dealer_code: "D42".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_signature_is_deterministic() {
        let adapter = adapter();
        let a = adapter.sign("1700000000", "GET", "/vehicles");
        let b = adapter.sign("1700000000", "GET", "/vehicles");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_signature_varies_with_inputs() {
        let adapter = adapter();
        let base = adapter.sign("1700000000", "GET", "/vehicles");
        assert_ne!(base, adapter.sign("1700000001", "GET", "/vehicles"));
        assert_ne!(base, adapter.sign("1700000000", "POST", "/vehicles"));
        assert_ne!(base, adapter.sign("1700000000", "GET", "/pricing/refresh"));
    }

    #[test]
    fn test_vehicle_wire_mapping() {
        let wire = json!({
            "vehicleIdentificationNumber": "2HGCM82633A004352",
            "manufacturer": "Honda",
            "model": "Accord",
            "modelYear": 2023,
            "trimLevel": "Sport",
            "odometer": 8400,
            "retailPrice": 31000.0,
            "inventoryStatus": "WORKSHOP",
            "optionDescriptions": ["Lane Keep Assist"]
        });

        let vehicle = parse_vehicle(&wire).unwrap();
        assert_eq!(vehicle.make, "Honda");
        assert_eq!(vehicle.status, VehicleStatus::Service);
        assert_eq!(vehicle.mileage, Some(8400));
        assert_eq!(vehicle.features, vec!["Lane Keep Assist"]);
    }

    #[test]
    fn test_filter_names_translated() {
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), Value::from("Honda"));
        filters.insert("year".to_string(), Value::from(2023));
        filters.insert("fuel_type".to_string(), Value::from("Hybrid"));

        let query = ProviderBAdapter::filter_query(Some(&filters));
        let keys: Vec<&str> = query.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"manufacturer"));
        assert!(keys.contains(&"modelYear"));
        assert!(keys.contains(&"fuel_type"));
    }

    #[tokio::test]
    async fn test_local_rate_limit_rejects_before_network() {
        let adapter = adapter();
        for _ in 0..RATE_LIMIT {
            let _ = adapter.limiter.try_acquire();
        }

        let err = adapter.get_inventory(None, 1, 0).await;
        assert!(matches!(err, Err(DmsError::RateLimit { .. })));
    }
}
