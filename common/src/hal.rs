//! Collaborator seams. Each platform (ESP-IDF firmware, host simulator, test
//! fakes) supplies implementations; the agent logic only sees these traits.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{
    error::{AgentError, TransportError},
    types::{Button, Rgb},
};

pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: Option<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 204)
    }
}

/// Blocking request/response. Calls run until the platform timeout; there is
/// no way to cancel one from elsewhere in the agent.
pub trait HttpTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError>;
}

pub trait MemoryMonitor {
    fn free_bytes(&self) -> Option<usize>;
    /// Release whatever the platform can give back before a retry.
    fn reclaim(&mut self);
}

pub trait WifiStation {
    fn set_active(&mut self, active: bool) -> Result<(), AgentError>;
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), AgentError>;
    fn is_connected(&self) -> bool;
    fn address(&self) -> Option<Ipv4Addr>;
}

/// BLE advertiser used while the radio is lent to broadcast mode.
pub trait BleBroadcaster {
    /// Starts advertising, or replaces the advertised data if already running.
    fn start_advertising(&mut self, device_name: &str, payload: &[u8]) -> Result<(), AgentError>;
    fn stop_advertising(&mut self) -> Result<(), AgentError>;
    /// Tears down the BLE stack so WiFi can use the radio again.
    fn release(&mut self);
}

/// GATT peripheral used by the provisioning session. Connection and write
/// events arrive asynchronously through a [`crate::provisioning::ProvisioningInbox`].
pub trait ProvisioningPeripheral {
    fn start_advertising(&mut self) -> Result<(), AgentError>;
    fn shutdown(&mut self);
}

pub trait Co2Sensor {
    fn data_ready(&mut self) -> Result<bool, AgentError>;
    /// Returns `(co2 ppm, temperature °C, relative humidity %)`.
    fn read(&mut self) -> Result<(u16, f32, f32), AgentError>;
    fn reinit(&mut self) -> Result<(), AgentError>;
}

pub trait LightSensor {
    fn read(&mut self) -> Option<u16>;
}

pub trait Display {
    fn show(&mut self, lines: &[String]);
}

pub trait Indicator {
    fn set_color(&mut self, color: Rgb);
}

/// Debounced button events; `pressed` reports a fresh press at most once.
pub trait Buttons {
    fn pressed(&mut self, button: Button) -> bool;
}
