//! Environment-driven configuration for the demo services.
//!
//! Both services read their settings from environment variables at startup;
//! every variable has a default suitable for running the pair locally.

/// Runtime configuration for the gateway service.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port to listen on (default: 8001).
    pub port: u16,
    /// Base URL of the dataplane service (default: `http://localhost:8002`).
    pub dataplane_url: String,
    /// OTLP/HTTP endpoint for span export. When unset, spans go to the
    /// console exporter instead.
    pub otlp_endpoint: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            dataplane_url: "http://localhost:8002".to_string(),
            otlp_endpoint: None,
        }
    }
}

impl GatewayConfig {
    /// Read the configuration from `GATEWAY_PORT`, `DATAPLANE_URL`, and
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("GATEWAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            dataplane_url: std::env::var("DATAPLANE_URL")
                .unwrap_or(defaults.dataplane_url),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Runtime configuration for the dataplane service.
#[derive(Debug, Clone)]
pub struct DataplaneConfig {
    /// TCP port to listen on (default: 8002).
    pub port: u16,
    /// OTLP/HTTP endpoint for span export. When unset, spans go to the
    /// console exporter instead.
    pub otlp_endpoint: Option<String>,
    /// Probability in `[0.0, 1.0]` that payment validation fails
    /// (default: 0.3).
    pub payment_failure_rate: f64,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            port: 8002,
            otlp_endpoint: None,
            payment_failure_rate: 0.3,
        }
    }
}

impl DataplaneConfig {
    /// Read the configuration from `DATAPLANE_PORT`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`, and `PAYMENT_FAILURE_RATE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("DATAPLANE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            payment_failure_rate: std::env::var("PAYMENT_FAILURE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(clamp_rate)
                .unwrap_or(defaults.payment_failure_rate),
        }
    }

    /// Fixed failure rate, mostly for tests.
    pub fn with_payment_failure_rate(mut self, rate: f64) -> Self {
        self.payment_failure_rate = clamp_rate(rate);
        self
    }
}

fn clamp_rate(rate: f64) -> f64 {
    rate.clamp(0.0, 1.0)
}
