use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    Temp,
    Humidity,
    Co2,
    Light,
}

impl MetricType {
    /// Evaluation order; breach lists are reported in this order.
    pub const ALL: [MetricType; 4] = [Self::Temp, Self::Humidity, Self::Co2, Self::Light];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temp => "TEMP",
            Self::Humidity => "HUMIDITY",
            Self::Co2 => "CO2",
            Self::Light => "LIGHT",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "TEMP" => Some(Self::Temp),
            "HUMIDITY" => Some(Self::Humidity),
            "CO2" => Some(Self::Co2),
            "LIGHT" => Some(Self::Light),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Temp => "Temperature",
            Self::Humidity => "Humidity",
            Self::Co2 => "CO2",
            Self::Light => "Light",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temp => "C",
            Self::Humidity => "%",
            Self::Co2 => "ppm",
            Self::Light => "lux",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light: Option<u16>,
}

impl SensorReading {
    pub fn value(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::Temp => Some(f64::from(self.temperature_c)),
            MetricType::Humidity => Some(f64::from(self.humidity_pct)),
            MetricType::Co2 => Some(f64::from(self.co2_ppm)),
            MetricType::Light => self.light.map(f64::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);
    pub const NORMAL: Rgb = Rgb::new(0, 5, 0);
    pub const ALERT: Rgb = Rgb::new(5, 0, 0);
    pub const BROADCAST: Rgb = Rgb::new(0, 0, 5);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Which protocol currently owns the single radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioMode {
    #[default]
    WifiBackend,
    BleBroadcast,
}

impl RadioMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WifiBackend => "WIFI_BACKEND",
            Self::BleBroadcast => "BLE_BROADCAST",
        }
    }
}

impl fmt::Display for RadioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    A,
    B,
    C,
}

impl Button {
    pub const ALL: [Button; 3] = [Self::A, Self::B, Self::C];
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorDataPayload {
    #[serde(rename = "co2Level")]
    pub co2_level: u16,
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "lightLevel", skip_serializing_if = "Option::is_none")]
    pub light_level: Option<u16>,
}

impl From<&SensorReading> for SensorDataPayload {
    fn from(reading: &SensorReading) -> Self {
        Self {
            co2_level: reading.co2_ppm,
            temperature: reading.temperature_c,
            humidity: reading.humidity_pct,
            light_level: reading.light,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorDataAccepted {
    #[serde(rename = "sensorDataId")]
    pub sensor_data_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdEntry {
    #[serde(rename = "metricType", default)]
    pub metric_type: Option<String>,
    #[serde(rename = "minValue", default)]
    pub min_value: Option<f64>,
    #[serde(rename = "maxValue", default)]
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    #[serde(rename = "alertType")]
    pub alert_type: &'static str,
    pub message: String,
    pub timestamp: i64,
    pub metric: MetricType,
    pub value: f64,
    pub unit: &'static str,
}
