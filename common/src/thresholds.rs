use std::{collections::BTreeMap, fmt};

use tracing::{debug, warn};

use crate::{
    error::AgentError,
    types::{MetricType, SensorReading, ThresholdEntry},
};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThresholdRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn breached_by(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max)
    }
}

/// Per-metric limits as last fetched from the backend. Replaced wholesale on
/// every successful fetch; an empty set enforces nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThresholdSet {
    ranges: BTreeMap<MetricType, ThresholdRange>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: MetricType, min: Option<f64>, max: Option<f64>) -> Self {
        self.ranges.insert(metric, ThresholdRange::new(min, max));
        self
    }

    pub fn from_entries(entries: &[ThresholdEntry]) -> Self {
        let mut set = Self::new();
        for entry in entries {
            let Some(name) = entry.metric_type.as_deref() else {
                continue;
            };
            match MetricType::parse(name) {
                Some(metric) => {
                    set.ranges.insert(
                        metric,
                        ThresholdRange::new(entry.min_value, entry.max_value),
                    );
                }
                None => debug!("ignoring threshold for unknown metric `{name}`"),
            }
        }
        set
    }

    pub fn get(&self, metric: MetricType) -> Option<&ThresholdRange> {
        self.ranges.get(&metric)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Metrics whose value lies outside their range, in [`MetricType::ALL`]
    /// order. Missing values and missing ranges never breach.
    pub fn evaluate(&self, reading: &SensorReading) -> Vec<MetricType> {
        MetricType::ALL
            .into_iter()
            .filter(|metric| {
                match (self.ranges.get(metric), reading.value(*metric)) {
                    (Some(range), Some(value)) => range.breached_by(value),
                    _ => false,
                }
            })
            .collect()
    }
}

impl fmt::Display for ThresholdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("None");
        }
        for (index, (metric, range)) in self.ranges.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{metric}(min={}, max={})",
                bound(range.min),
                bound(range.max)
            )?;
        }
        Ok(())
    }
}

fn bound(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdAlert {
    pub metric: MetricType,
    pub value: f64,
}

/// Destination for threshold notifications.
pub trait AlertSink {
    fn notify(&mut self, alert: &ThresholdAlert) -> Result<(), AgentError>;
}

/// Rate-limits notifications per metric. The cooldown clock starts at every
/// attempt, successful or not.
#[derive(Debug)]
pub struct AlertDispatcher {
    cooldown_ms: u64,
    last_sent: BTreeMap<MetricType, u64>,
}

impl AlertDispatcher {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last_sent: BTreeMap::new(),
        }
    }

    pub fn last_sent(&self, metric: MetricType) -> Option<u64> {
        self.last_sent.get(&metric).copied()
    }

    fn eligible(&self, metric: MetricType, now_ms: u64) -> bool {
        self.last_sent(metric)
            .map_or(true, |sent| now_ms.saturating_sub(sent) >= self.cooldown_ms)
    }

    /// Returns how many notifications were attempted.
    pub fn dispatch(
        &mut self,
        breaches: &[MetricType],
        reading: &SensorReading,
        now_ms: u64,
        sink: &mut dyn AlertSink,
    ) -> usize {
        let mut attempted = 0;
        for &metric in breaches {
            let Some(value) = reading.value(metric) else {
                continue;
            };
            if !self.eligible(metric, now_ms) {
                continue;
            }

            self.last_sent.insert(metric, now_ms);
            attempted += 1;
            if let Err(err) = sink.notify(&ThresholdAlert { metric, value }) {
                warn!("{metric} alert notification failed: {err}");
            }
        }
        attempted
    }
}
