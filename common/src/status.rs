//! What the user sees: the 16-column status display and the RGB indicator.

use std::net::Ipv4Addr;

use crate::{
    hal::{Clock, Display, Indicator},
    thresholds::{ThresholdRange, ThresholdSet},
    types::{MetricType, Rgb, SensorReading},
};

pub const LINE_WIDTH: usize = 16;
const STATUS_WIDTH: usize = 12;
const ALERT_METRICS_WIDTH: usize = 6;

fn clip(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

pub fn reading_screen(
    reading: &SensorReading,
    breaches: &[MetricType],
    send_failed: bool,
) -> Vec<String> {
    let status = if !breaches.is_empty() {
        let names: Vec<&str> = breaches.iter().map(|metric| metric.as_str()).collect();
        format!("ALRT {}", clip(&names.join(","), ALERT_METRICS_WIDTH))
    } else if send_failed {
        "SEND ERR".to_string()
    } else {
        "OK".to_string()
    };
    let light = reading
        .light
        .map_or_else(|| "-".to_string(), |light| light.to_string());

    vec![
        clip(&status, STATUS_WIDTH),
        clip(
            &format!(
                "T{} H{}",
                reading.temperature_c as i32, reading.humidity_pct as i32
            ),
            LINE_WIDTH,
        ),
        clip(&format!("C{} L{light}", reading.co2_ppm), LINE_WIDTH),
    ]
}

pub fn network_screen(ssid: &str, address: Option<Ipv4Addr>) -> Vec<String> {
    let address = address.map_or_else(|| "No IP".to_string(), |address| address.to_string());
    let tail: String = {
        let chars: Vec<char> = address.chars().collect();
        chars[chars.len().saturating_sub(12)..].iter().collect()
    };
    vec!["WiFi".to_string(), clip(ssid, LINE_WIDTH), format!("IP:{tail}")]
}

fn range_text(range: Option<&ThresholdRange>) -> String {
    let Some(range) = range else {
        return "-".to_string();
    };
    let bound = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| (v as i64).to_string());
    format!("{}-{}", bound(range.min), bound(range.max))
}

pub fn thresholds_screen(thresholds: &ThresholdSet) -> Vec<String> {
    let text = |metric| range_text(thresholds.get(metric));
    vec![
        "THR".to_string(),
        clip(
            &format!(
                "T:{} H:{}",
                text(MetricType::Temp),
                text(MetricType::Humidity)
            ),
            LINE_WIDTH,
        ),
        clip(
            &format!("C:{} L:{}", text(MetricType::Co2), text(MetricType::Light)),
            LINE_WIDTH,
        ),
    ]
}

pub fn admin_screen(message: Option<&str>) -> Vec<String> {
    let message = message.unwrap_or("No admin msg");
    let mut lines = vec!["Admin".to_string(), clip(message, LINE_WIDTH)];
    let rest: String = message.chars().skip(LINE_WIDTH).take(LINE_WIDTH).collect();
    if !rest.is_empty() {
        lines.push(rest);
    }
    lines
}

pub fn waiting_screen() -> Vec<String> {
    vec![String::new(), "Waiting...".to_string()]
}

pub fn sensor_error_screen() -> Vec<String> {
    vec![String::new(), "Sensor ERROR".to_string()]
}

pub fn wifi_screen(connected: Option<Ipv4Addr>) -> Vec<String> {
    match connected {
        Some(address) => {
            let address = address.to_string();
            let tail: String = address
                .chars()
                .skip(address.chars().count().saturating_sub(9))
                .collect();
            vec!["WiFi OK".to_string(), format!("IP: {tail}")]
        }
        None => vec![String::new(), "WiFi ERROR".to_string()],
    }
}

/// Display with timed overrides: while an override (button screen, admin
/// message) is up, routine status updates are held back.
pub struct StatusScreen {
    display: Box<dyn Display>,
    override_until_ms: u64,
}

impl StatusScreen {
    pub fn new(display: Box<dyn Display>) -> Self {
        Self {
            display,
            override_until_ms: 0,
        }
    }

    pub fn overridden(&self, now_ms: u64) -> bool {
        now_ms < self.override_until_ms
    }

    pub fn show_override(&mut self, lines: &[String], now_ms: u64, duration_ms: u64) {
        self.display.show(lines);
        self.override_until_ms = now_ms.saturating_add(duration_ms);
    }

    /// Returns whether the lines were drawn.
    pub fn show_status(&mut self, lines: &[String], now_ms: u64) -> bool {
        if self.overridden(now_ms) {
            return false;
        }
        self.display.show(lines);
        true
    }
}

pub struct StatusLight {
    indicator: Box<dyn Indicator>,
    current: Option<Rgb>,
}

impl StatusLight {
    pub fn new(indicator: Box<dyn Indicator>) -> Self {
        Self {
            indicator,
            current: None,
        }
    }

    pub fn current(&self) -> Option<Rgb> {
        self.current
    }

    pub fn set(&mut self, color: Rgb) {
        if self.current != Some(color) {
            self.indicator.set_color(color);
            self.current = Some(color);
        }
    }

    /// Blinks `color` against the current color, then settles on `rest`.
    pub fn flash(&mut self, color: Rgb, count: u8, delay_ms: u64, rest: Rgb, clock: &dyn Clock) {
        let between = self.current.unwrap_or(Rgb::OFF);
        for _ in 0..count {
            self.indicator.set_color(color);
            clock.sleep_ms(delay_ms);
            self.indicator.set_color(between);
            clock.sleep_ms(delay_ms);
        }
        self.indicator.set_color(rest);
        self.current = Some(rest);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fakes::{FakeClock, RecordingDisplay, RecordingIndicator};

    fn reading(light: Option<u16>) -> SensorReading {
        SensorReading {
            co2_ppm: 612,
            temperature_c: 22.8,
            humidity_pct: 41.2,
            light,
        }
    }

    #[test]
    fn reading_screen_reports_status() {
        assert_eq!(
            reading_screen(&reading(Some(830)), &[], false),
            vec!["OK", "T22 H41", "C612 L830"]
        );
        assert_eq!(
            reading_screen(&reading(None), &[MetricType::Temp, MetricType::Co2], true),
            vec!["ALRT TEMP,C", "T22 H41", "C612 L-"]
        );
        assert_eq!(reading_screen(&reading(None), &[], true)[0], "SEND ERR");
    }

    #[test]
    fn info_screens_fit_the_display() {
        assert_eq!(
            network_screen("a-very-long-network-name", Some(Ipv4Addr::new(192, 168, 100, 200))),
            vec!["WiFi", "a-very-long-netw", "IP:.168.100.200"]
        );
        assert_eq!(
            thresholds_screen(&ThresholdSet::new().with(MetricType::Temp, Some(18.0), Some(26.5))),
            vec!["THR", "T:18-26 H:-", "C:- L:-"]
        );
        assert_eq!(
            admin_screen(Some("Filter replacement due next week")),
            vec!["Admin", "Filter replaceme", "nt due next week"]
        );
    }

    #[test]
    fn overrides_hold_back_status_updates() {
        let display = RecordingDisplay::default();
        let mut screen = StatusScreen::new(Box::new(display.clone()));

        screen.show_override(&admin_screen(Some("hi")), 1_000, 4_000);
        assert!(!screen.show_status(&waiting_screen(), 4_999));
        assert_eq!(display.last()[0], "Admin");

        assert!(screen.show_status(&waiting_screen(), 5_000));
        assert_eq!(display.last(), waiting_screen());
    }

    #[test]
    fn flash_returns_to_rest_color() {
        let indicator = RecordingIndicator::default();
        let clock = FakeClock::new();
        let mut light = StatusLight::new(Box::new(indicator.clone()));
        light.set(Rgb::ALERT);

        light.flash(Rgb::new(0, 0, 255), 3, 180, Rgb::NORMAL, &clock);

        let colors = indicator.colors.borrow();
        assert_eq!(colors.len(), 1 + 3 * 2 + 1);
        assert_eq!(colors[1], Rgb::new(0, 0, 255));
        assert_eq!(colors[2], Rgb::ALERT);
        assert_eq!(*colors.last().unwrap(), Rgb::NORMAL);
        assert_eq!(clock.now_ms(), 6 * 180);
        assert_eq!(light.current(), Some(Rgb::NORMAL));
    }

    #[test]
    fn redundant_colors_are_not_rewritten() {
        let indicator = RecordingIndicator::default();
        let mut light = StatusLight::new(Box::new(indicator.clone()));

        light.set(Rgb::NORMAL);
        light.set(Rgb::NORMAL);

        assert_eq!(indicator.colors.borrow().len(), 1);
    }
}
