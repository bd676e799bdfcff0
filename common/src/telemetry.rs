use crate::{config::AgentConfig, types::SensorReading};

/// The values a broadcast advertisement carries, at advertised precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTuple {
    pub co2: u16,
    pub temperature_tenths: i32,
    pub humidity_tenths: i32,
    pub light: Option<u16>,
}

impl From<&SensorReading> for BroadcastTuple {
    fn from(reading: &SensorReading) -> Self {
        Self {
            co2: reading.co2_ppm,
            temperature_tenths: tenths(reading.temperature_c),
            humidity_tenths: tenths(reading.humidity_pct),
            light: reading.light,
        }
    }
}

fn tenths(value: f32) -> i32 {
    (f64::from(value) * 10.0).round() as i32
}

fn format_tenths(value: i32) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let magnitude = value.unsigned_abs();
    format!("{sign}{}.{}", magnitude / 10, magnitude % 10)
}

/// Manufacturer data of the form `c<co2>t<temp>h<hum>l<light>`, cut to
/// `budget` bytes. A missing light level is written as `-`.
pub fn encode_advertisement(tuple: &BroadcastTuple, budget: usize) -> Vec<u8> {
    let light = tuple
        .light
        .map_or_else(|| "-".to_string(), |light| light.to_string());
    let mut encoded = format!(
        "c{}t{}h{}l{}",
        tuple.co2,
        format_tenths(tuple.temperature_tenths),
        format_tenths(tuple.humidity_tenths),
        light
    )
    .into_bytes();
    encoded.truncate(budget);
    encoded
}

/// Paces telemetry: backend posts at a fixed interval, advertisement updates
/// only on change and no faster than the broadcast interval.
#[derive(Debug)]
pub struct TelemetryReporter {
    post_interval_ms: u64,
    broadcast_interval_ms: u64,
    budget: usize,
    last_post_ms: Option<u64>,
    last_broadcast: Option<(BroadcastTuple, u64)>,
}

impl TelemetryReporter {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            post_interval_ms: config.telemetry_interval_ms,
            broadcast_interval_ms: config.broadcast_update_interval_ms,
            budget: config.broadcast_payload_budget,
            last_post_ms: None,
            last_broadcast: None,
        }
    }

    pub fn post_due(&self, now_ms: u64) -> bool {
        self.last_post_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.post_interval_ms)
    }

    /// Records a post attempt; failures wait for the same interval.
    pub fn mark_posted(&mut self, now_ms: u64) {
        self.last_post_ms = Some(now_ms);
    }

    /// Payload for a fresh advertisement. Empty when nothing has been read
    /// yet, in which case only the device name is advertised.
    pub fn advertisement(&self, reading: Option<&SensorReading>) -> Vec<u8> {
        reading.map_or_else(Vec::new, |reading| {
            encode_advertisement(&BroadcastTuple::from(reading), self.budget)
        })
    }

    /// Returns a new payload when the advertised tuple changed and the
    /// minimum update interval has passed.
    pub fn broadcast_update(&self, reading: &SensorReading, now_ms: u64) -> Option<Vec<u8>> {
        let tuple = BroadcastTuple::from(reading);
        if let Some((last, at)) = self.last_broadcast {
            if last == tuple || now_ms.saturating_sub(at) < self.broadcast_interval_ms {
                return None;
            }
        }
        Some(encode_advertisement(&tuple, self.budget))
    }

    pub fn note_broadcast(&mut self, reading: Option<&SensorReading>, now_ms: u64) {
        self.last_broadcast = reading.map(|reading| (BroadcastTuple::from(reading), now_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(co2_ppm: u16, temperature_c: f32, light: Option<u16>) -> SensorReading {
        SensorReading {
            co2_ppm,
            temperature_c,
            humidity_pct: 41.26,
            light,
        }
    }

    #[test]
    fn encodes_rounded_values() {
        let tuple = BroadcastTuple::from(&reading(612, 22.46, Some(830)));

        assert_eq!(encode_advertisement(&tuple, 24), b"c612t22.5h41.3l830");
    }

    #[test]
    fn encodes_missing_light_and_negative_temperatures() {
        let tuple = BroadcastTuple::from(&reading(400, -0.44, None));

        assert_eq!(encode_advertisement(&tuple, 24), b"c400t-0.4h41.3l-");
    }

    #[test]
    fn trims_to_payload_budget() {
        let tuple = BroadcastTuple::from(&reading(40_000, 100.0, Some(65_000)));

        let payload = encode_advertisement(&tuple, 12);

        assert_eq!(payload, b"c40000t100.0");
    }

    #[test]
    fn post_interval_gates_attempts() {
        let mut reporter = TelemetryReporter::new(&AgentConfig::default());

        assert!(reporter.post_due(0));
        reporter.mark_posted(0);
        assert!(!reporter.post_due(4_999));
        assert!(reporter.post_due(5_000));
    }

    #[test]
    fn broadcast_updates_need_change_and_interval() {
        let mut reporter = TelemetryReporter::new(&AgentConfig::default());
        let first = reading(600, 21.0, Some(100));
        let changed = reading(640, 21.0, Some(100));

        assert!(reporter.broadcast_update(&first, 0).is_some());
        reporter.note_broadcast(Some(&first), 0);

        assert!(reporter.broadcast_update(&first, 10_000).is_none());
        assert!(reporter.broadcast_update(&changed, 1_999).is_none());
        assert_eq!(
            reporter.broadcast_update(&changed, 2_000).unwrap(),
            b"c640t21.0h41.3l100"
        );
    }

    #[test]
    fn sub_precision_changes_are_not_rebroadcast() {
        let mut reporter = TelemetryReporter::new(&AgentConfig::default());
        reporter.note_broadcast(Some(&reading(600, 21.01, None)), 0);

        assert!(reporter
            .broadcast_update(&reading(600, 21.04, None), 60_000)
            .is_none());
    }
}
