use tracing::{debug, warn};

use crate::{
    config::AgentConfig,
    error::AgentError,
    hal::{Co2Sensor, LightSensor},
    types::SensorReading,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The poll interval has not elapsed yet.
    Idle,
    NotReady { reinitialized: bool },
    Reading(SensorReading),
}

pub struct SensorPoller {
    co2: Option<Box<dyn Co2Sensor>>,
    light: Option<Box<dyn LightSensor>>,
    poll_interval_ms: u64,
    reinit_timeout_ms: u64,
    last_poll_ms: Option<u64>,
    not_ready_ms: u64,
}

impl SensorPoller {
    /// `co2` is `None` when the sensor failed to initialize at boot.
    pub fn new(
        co2: Option<Box<dyn Co2Sensor>>,
        light: Option<Box<dyn LightSensor>>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            co2,
            light,
            poll_interval_ms: config.sensor_poll_interval_ms,
            reinit_timeout_ms: config.sensor_reinit_timeout_ms,
            last_poll_ms: None,
            not_ready_ms: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.co2.is_some()
    }

    pub fn poll(&mut self, now_ms: u64) -> Result<PollOutcome, AgentError> {
        let Some(co2) = self.co2.as_mut() else {
            return Err(AgentError::Sensor("CO2 sensor not initialized".into()));
        };
        if self
            .last_poll_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.poll_interval_ms)
        {
            return Ok(PollOutcome::Idle);
        }
        self.last_poll_ms = Some(now_ms);

        if !co2.data_ready()? {
            self.not_ready_ms += self.poll_interval_ms;
            debug!("CO2 sensor not ready ({} ms)", self.not_ready_ms);
            if self.not_ready_ms < self.reinit_timeout_ms {
                return Ok(PollOutcome::NotReady {
                    reinitialized: false,
                });
            }
            warn!(
                "CO2 sensor not ready for {} ms, reinitializing",
                self.not_ready_ms
            );
            self.not_ready_ms = 0;
            co2.reinit()?;
            return Ok(PollOutcome::NotReady {
                reinitialized: true,
            });
        }

        let (co2_ppm, temperature_c, humidity_pct) = co2.read()?;
        let light = self.light.as_mut().and_then(|sensor| sensor.read());
        self.not_ready_ms = 0;

        Ok(PollOutcome::Reading(SensorReading {
            co2_ppm,
            temperature_c,
            humidity_pct,
            light,
        }))
    }

    /// Stop/start cycle after a fault. Errors are logged; the next poll
    /// reports whatever state the sensor is left in.
    pub fn force_reinit(&mut self) {
        self.not_ready_ms = 0;
        if let Some(co2) = self.co2.as_mut() {
            if let Err(err) = co2.reinit() {
                warn!("CO2 sensor reinit failed: {err}");
            }
        }
    }
}
