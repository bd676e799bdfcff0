use serde::{Deserialize, Serialize};

use crate::hal::HttpMethod;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub tick_interval_ms: u64,
    pub sensor_poll_interval_ms: u64,
    pub sensor_reinit_timeout_ms: u64,
    pub fault_cooldown_ms: u64,
    pub telemetry_interval_ms: u64,
    pub threshold_refresh_interval_ms: u64,
    pub command_check_interval_ms: u64,
    pub alert_cooldown_ms: u64,
    pub broadcast_update_interval_ms: u64,
    pub broadcast_payload_budget: usize,
    pub broadcast_device_name: String,
    pub wifi_connect_ticks: u32,
    pub wifi_settle_ms: u64,
    pub memory_retry_backoff_ms: u64,
    pub led_flash_count: u8,
    pub led_flash_delay_ms: u64,
    pub info_screen_ms: u64,
    pub admin_screen_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            sensor_poll_interval_ms: 10_000,
            sensor_reinit_timeout_ms: 30_000,
            fault_cooldown_ms: 5_000,
            telemetry_interval_ms: 5_000,
            threshold_refresh_interval_ms: 10_000,
            command_check_interval_ms: 10_000,
            alert_cooldown_ms: 300_000,
            broadcast_update_interval_ms: 2_000,
            broadcast_payload_budget: 24,
            broadcast_device_name: "EG-SENSOR".to_string(),
            wifi_connect_ticks: 20,
            wifi_settle_ms: 500,
            memory_retry_backoff_ms: 250,
            led_flash_count: 3,
            led_flash_delay_ms: 180,
            info_screen_ms: 3_000,
            admin_screen_ms: 4_000,
        }
    }
}

impl AgentConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        self.sensor_poll_interval_ms = self.sensor_poll_interval_ms.max(1_000);
        if self.sensor_reinit_timeout_ms < self.sensor_poll_interval_ms {
            self.sensor_reinit_timeout_ms = self.sensor_poll_interval_ms;
        }
        if self.telemetry_interval_ms == 0 {
            self.telemetry_interval_ms = defaults.telemetry_interval_ms;
        }
        if self.command_check_interval_ms == 0 {
            self.command_check_interval_ms = defaults.command_check_interval_ms;
        }
        if self.threshold_refresh_interval_ms == 0 {
            self.threshold_refresh_interval_ms = defaults.threshold_refresh_interval_ms;
        }
        self.broadcast_payload_budget = self.broadcast_payload_budget.clamp(8, 24);
        if self.broadcast_device_name.trim().is_empty() {
            self.broadcast_device_name = defaults.broadcast_device_name;
        }
        self.wifi_connect_ticks = self.wifi_connect_ticks.clamp(1, 120);
    }
}

/// Whether a command is acknowledged before or after it runs locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckOrder {
    #[default]
    AfterExecute,
    BeforeExecute,
}

/// One acknowledgment attempt. `path` is relative to the API prefix and
/// carries an `{id}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCandidate {
    pub method: HttpMethod,
    pub path: String,
}

impl AckCandidate {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
        }
    }

    pub fn render(&self, id: &str) -> String {
        self.path.replace("{id}", id)
    }
}

pub fn default_ack_candidates() -> Vec<AckCandidate> {
    vec![
        AckCandidate::new(HttpMethod::Put, "/commands/{id}/ack"),
        AckCandidate::new(HttpMethod::Post, "/commands/{id}/ack"),
        AckCandidate::new(HttpMethod::Put, "/commands/{id}/acknowledge"),
        AckCandidate::new(HttpMethod::Post, "/commands/{id}/acknowledge"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub port: u16,
    pub api_prefix: String,
    pub device_key_header: String,
    pub request_timeout_ms: u64,
    pub webhook_url: Option<String>,
    pub ack_candidates: Vec<AckCandidate>,
    pub ack_order: AckOrder,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_prefix: "/api/device".to_string(),
            device_key_header: "X-Device-Key".to_string(),
            request_timeout_ms: 10_000,
            webhook_url: None,
            ack_candidates: default_ack_candidates(),
            ack_order: AckOrder::AfterExecute,
        }
    }
}

impl BackendConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 8080;
        }
        if self.ack_candidates.is_empty() {
            self.ack_candidates = default_ack_candidates();
        }
        if self.device_key_header.trim().is_empty() {
            self.device_key_header = "X-Device-Key".to_string();
        }
        if self
            .webhook_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            self.webhook_url = None;
        }
        self.request_timeout_ms = self.request_timeout_ms.clamp(1_000, 60_000);
    }

    /// Expands a bare backend host into a base URL; full URLs pass through.
    pub fn base_url(&self, backend_host: &str) -> String {
        let host = backend_host.trim().trim_end_matches('/');
        let root = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}:{}", self.port)
        };
        format!("{root}{}", self.api_prefix)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub backend: BackendConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.agent.sanitize();
        self.backend.sanitize();
    }
}
