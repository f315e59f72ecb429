//! Shared application state

use std::sync::Arc;

use dealership_agent::Engine;
use metrics_exporter_prometheus::PrometheusHandle;

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub prometheus: PrometheusHandle,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, prometheus: PrometheusHandle) -> Self {
        Self { engine, prometheus }
    }
}
