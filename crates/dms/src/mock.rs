//! Mock DMS adapter
//!
//! Generates a stable 50-vehicle inventory on construction. No network;
//! backs demos, local development, and the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dealership_core::{ServiceRecord, Vehicle, VehicleCategory, VehicleStatus};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::{validate_vin, whitelist_filters, DmsAdapter, DmsError, DmsStats, PricingSync, StatsCell};

const INVENTORY_SIZE: usize = 50;
/// VIN alphabet excludes I, O, Q
const VIN_CHARS: &[u8] = b"ABCDEFGHJKLMNPRSTUVWXYZ1234567890";

const MAKES_MODELS: [(&str, &[&str]); 7] = [
    ("Toyota", &["Camry", "Corolla", "RAV4", "Highlander", "Tacoma"]),
    ("Honda", &["Accord", "Civic", "CR-V", "Pilot", "Ridgeline"]),
    ("Ford", &["F-150", "Mustang", "Explorer", "Escape", "Bronco"]),
    ("Chevrolet", &["Silverado", "Equinox", "Malibu", "Tahoe"]),
    ("Tesla", &["Model 3", "Model Y", "Model S", "Model X"]),
    ("BMW", &["3 Series", "5 Series", "X3", "X5"]),
    ("Mercedes-Benz", &["C-Class", "E-Class", "GLE", "GLC"]),
];

const COLORS: [&str; 7] = ["Black", "White", "Silver", "Gray", "Blue", "Red", "Green"];
const TRIMS: [&str; 6] = ["Base", "Sport", "Limited", "Premium", "LE", "SE"];
const FUEL_TYPES: [&str; 4] = ["Gasoline", "Diesel", "Hybrid", "Plug-in Hybrid"];
const TRANSMISSIONS: [&str; 3] = ["Automatic", "Manual", "CVT"];
const FEATURES: [&str; 8] = [
    "Backup Camera",
    "Bluetooth",
    "Navigation",
    "Sunroof",
    "Leather Seats",
    "Heated Seats",
    "Apple CarPlay",
    "Android Auto",
];
const SERVICE_TYPES: [&str; 7] = [
    "Oil Change",
    "Tire Rotation",
    "Brake Inspection",
    "Battery Replacement",
    "Transmission Service",
    "Air Filter Replacement",
    "Coolant Flush",
];

/// Network-free adapter over generated inventory
pub struct MockAdapter {
    inventory: RwLock<Vec<Vehicle>>,
    rng: Mutex<StdRng>,
    stats: StatsCell,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Seeded construction for reproducible tests
    pub fn with_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let inventory = Self::generate_inventory(&mut rng);
        Self {
            inventory: RwLock::new(inventory),
            rng: Mutex::new(rng),
            stats: StatsCell::default(),
        }
    }

    fn generate_inventory(rng: &mut StdRng) -> Vec<Vehicle> {
        let now = Utc::now();
        (0..INVENTORY_SIZE)
            .map(|i| {
                let (make, models) = MAKES_MODELS[rng.gen_range(0..MAKES_MODELS.len())];
                let model = models[rng.gen_range(0..models.len())];
                let vin: String = (0..17)
                    .map(|_| VIN_CHARS[rng.gen_range(0..VIN_CHARS.len())] as char)
                    .collect();

                let fuel_type = if make == "Tesla" {
                    "Electric".to_string()
                } else {
                    FUEL_TYPES[rng.gen_range(0..FUEL_TYPES.len())].to_string()
                };
                // Mostly available so demo queries find stock
                let status = match rng.gen_range(0..5) {
                    0 => VehicleStatus::Sold,
                    1 => VehicleStatus::Reserved,
                    _ => VehicleStatus::Available,
                };

                Vehicle {
                    vin,
                    make: make.to_string(),
                    model: model.to_string(),
                    year: rng.gen_range(2020..=2025),
                    trim: TRIMS[rng.gen_range(0..TRIMS.len())].to_string(),
                    color_exterior: Some(COLORS[rng.gen_range(0..COLORS.len())].to_string()),
                    color_interior: Some(["Black", "Beige", "Gray"][rng.gen_range(0..3)].to_string()),
                    mileage: Some(rng.gen_range(0..50_000)),
                    price: Some((rng.gen_range(20_000.0..80_000.0_f64) * 100.0).round() / 100.0),
                    status,
                    category: Some(if rng.gen_bool(0.5) {
                        VehicleCategory::New
                    } else {
                        VehicleCategory::Used
                    }),
                    fuel_type: Some(fuel_type),
                    transmission: Some(
                        TRANSMISSIONS[rng.gen_range(0..TRANSMISSIONS.len())].to_string(),
                    ),
                    engine: Some(format!(
                        "{} {}",
                        ["2.0L", "2.5L", "3.0L", "3.5L", "5.0L"][rng.gen_range(0..5)],
                        ["I4", "V6", "V8"][rng.gen_range(0..3)]
                    )),
                    features: (0..rng.gen_range(2..6))
                        .map(|_| FEATURES[rng.gen_range(0..FEATURES.len())].to_string())
                        .collect(),
                    dealer_id: Some("MAIN".to_string()),
                    stock_number: Some(format!("STK{}", 1001 + i)),
                    updated_at: now - ChronoDuration::days(rng.gen_range(1..90)),
                }
            })
            .collect()
    }

    fn matches_filters(vehicle: &Vehicle, filters: &HashMap<String, Value>) -> bool {
        for (key, value) in filters {
            let ok = match key.as_str() {
                "make" => value
                    .as_str()
                    .map(|v| vehicle.make.eq_ignore_ascii_case(v))
                    .unwrap_or(false),
                "model" => value
                    .as_str()
                    .map(|v| vehicle.model.eq_ignore_ascii_case(v))
                    .unwrap_or(false),
                "year" => value.as_i64().map(|v| vehicle.year as i64 == v).unwrap_or(false),
                "status" => value
                    .as_str()
                    .map(|v| vehicle.status.as_str() == v)
                    .unwrap_or(false),
                "fuel_type" => vehicle
                    .fuel_type
                    .as_deref()
                    .zip(value.as_str())
                    .map(|(have, want)| have.eq_ignore_ascii_case(want))
                    .unwrap_or(false),
                "min_price" => vehicle
                    .price
                    .zip(value.as_f64())
                    .map(|(p, min)| p >= min)
                    .unwrap_or(false),
                "max_price" => vehicle
                    .price
                    .zip(value.as_f64())
                    .map(|(p, max)| p <= max)
                    .unwrap_or(false),
                "category" => true,
                _ => true,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl DmsAdapter for MockAdapter {
    async fn get_inventory(
        &self,
        filters: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Vehicle>, DmsError> {
        self.stats.record_request();
        let allowed = whitelist_filters(filters);

        let inventory = self.inventory.read();
        Ok(inventory
            .iter()
            .filter(|v| Self::matches_filters(v, &allowed))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_vehicle_details(&self, vin: &str) -> Result<Option<Vehicle>, DmsError> {
        self.stats.record_request();
        validate_vin(vin)?;
        Ok(self.inventory.read().iter().find(|v| v.vin == vin).cloned())
    }

    async fn get_service_history(&self, vin: &str) -> Result<Vec<ServiceRecord>, DmsError> {
        self.stats.record_request();
        validate_vin(vin)?;

        let Some(vehicle) = self.inventory.read().iter().find(|v| v.vin == vin).cloned() else {
            return Ok(Vec::new());
        };

        let mut rng = self.rng.lock();
        let count = rng.gen_range(1..=5);
        let mut records: Vec<ServiceRecord> = (0..count)
            .map(|_| ServiceRecord {
                service_date: Utc::now() - ChronoDuration::days(rng.gen_range(30..365)),
                service_type: SERVICE_TYPES[rng.gen_range(0..SERVICE_TYPES.len())].to_string(),
                mileage_at_service: rng.gen_range(5_000..vehicle.mileage.unwrap_or(50_000).max(5_001)),
                cost: (rng.gen_range(50.0..500.0_f64) * 100.0).round() / 100.0,
                notes: Some("Service completed successfully".to_string()),
            })
            .collect();

        records.sort_by(|a, b| b.service_date.cmp(&a.service_date));
        Ok(records)
    }

    async fn search_vehicles(
        &self,
        query: &str,
        filters: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Vehicle>, DmsError> {
        self.stats.record_request();
        let needle = query.to_lowercase();
        let allowed = whitelist_filters(filters);

        Ok(self
            .inventory
            .read()
            .iter()
            .filter(|v| {
                let haystack = format!(
                    "{} {} {} {} {}",
                    v.make,
                    v.model,
                    v.year,
                    v.color_exterior.as_deref().unwrap_or(""),
                    v.features.join(" ")
                )
                .to_lowercase();
                haystack.contains(&needle) && Self::matches_filters(v, &allowed)
            })
            .cloned()
            .collect())
    }

    async fn sync_pricing(&self) -> Result<PricingSync, DmsError> {
        self.stats.record_request();
        let mut rng = self.rng.lock();
        let mut inventory = self.inventory.write();
        let mut updated = 0;

        for vehicle in inventory.iter_mut() {
            if rng.gen_bool(0.3) {
                if let Some(price) = vehicle.price {
                    let adjustment = rng.gen_range(-0.05..0.05);
                    vehicle.price = Some((price * (1.0 + adjustment) * 100.0).round() / 100.0);
                    vehicle.updated_at = Utc::now();
                    updated += 1;
                }
            }
        }

        Ok(PricingSync {
            updated_count: updated,
            error_count: 0,
            timestamp: Utc::now(),
        })
    }

    fn stats(&self) -> DmsStats {
        self.stats.snapshot()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inventory_size_and_vins() {
        let adapter = MockAdapter::with_seed(7);
        let all = adapter.get_inventory(None, 100, 0).await.unwrap();
        assert_eq!(all.len(), INVENTORY_SIZE);
        for vehicle in &all {
            assert_eq!(vehicle.vin.len(), 17);
        }
    }

    #[tokio::test]
    async fn test_inventory_filtering() {
        let adapter = MockAdapter::with_seed(7);
        let mut filters = HashMap::new();
        filters.insert("make".to_string(), Value::from("Toyota"));
        filters.insert("max_price".to_string(), Value::from(60_000.0));

        let toyotas = adapter.get_inventory(Some(&filters), 100, 0).await.unwrap();
        for vehicle in &toyotas {
            assert_eq!(vehicle.make, "Toyota");
            assert!(vehicle.price.unwrap() <= 60_000.0);
        }
    }

    #[tokio::test]
    async fn test_pagination() {
        let adapter = MockAdapter::with_seed(7);
        let first = adapter.get_inventory(None, 10, 0).await.unwrap();
        let second = adapter.get_inventory(None, 10, 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_ne!(first[0].vin, second[0].vin);
    }

    #[tokio::test]
    async fn test_vehicle_details_roundtrip() {
        let adapter = MockAdapter::with_seed(7);
        let vin = adapter.get_inventory(None, 1, 0).await.unwrap()[0].vin.clone();

        let found = adapter.get_vehicle_details(&vin).await.unwrap();
        assert!(found.is_some());

        let absent = adapter
            .get_vehicle_details("ZZZZZZZZZZZZZZZZZ")
            .await
            .unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn test_invalid_vin_rejected() {
        let adapter = MockAdapter::with_seed(7);
        assert!(matches!(
            adapter.get_vehicle_details("short").await,
            Err(DmsError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_matches_status() {
        let adapter = MockAdapter::with_seed(7);
        let all = adapter.get_inventory(None, 100, 0).await.unwrap();

        for vehicle in all.iter().take(10) {
            let available = adapter.check_availability(&vehicle.vin).await.unwrap();
            assert_eq!(available, vehicle.status == VehicleStatus::Available);
        }
    }

    #[tokio::test]
    async fn test_service_history_sorted_descending() {
        let adapter = MockAdapter::with_seed(7);
        let vin = adapter.get_inventory(None, 1, 0).await.unwrap()[0].vin.clone();

        let history = adapter.get_service_history(&vin).await.unwrap();
        assert!(!history.is_empty());
        for pair in history.windows(2) {
            assert!(pair[0].service_date >= pair[1].service_date);
        }
    }

    #[tokio::test]
    async fn test_search_matches_make() {
        let adapter = MockAdapter::with_seed(7);
        let results = adapter.search_vehicles("toyota", None).await.unwrap();
        assert!(results.iter().all(|v| v.make == "Toyota"));
    }

    #[tokio::test]
    async fn test_sync_pricing_reports_counts() {
        let adapter = MockAdapter::with_seed(7);
        let sync = adapter.sync_pricing().await.unwrap();
        assert_eq!(sync.error_count, 0);
        assert!(sync.updated_count <= INVENTORY_SIZE);
    }

    #[tokio::test]
    async fn test_health_check() {
        let adapter = MockAdapter::with_seed(7);
        assert!(adapter.health_check().await);
    }
}
