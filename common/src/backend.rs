use std::rc::Rc;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{
    commands::RawCommand,
    config::{AckCandidate, AgentConfig, BackendConfig},
    credentials::Credentials,
    error::{AgentError, TransportError},
    hal::{Clock, HttpMethod, HttpRequest, HttpResponse, HttpTransport, MemoryMonitor},
    radio::BackendPermit,
    thresholds::{AlertSink, ThresholdAlert, ThresholdSet},
    types::{SensorDataAccepted, SensorDataPayload, SensorReading, ThresholdEntry, WebhookPayload},
};

const ALERT_TYPE_THRESHOLD: &str = "THRESHOLD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub attempts: usize,
    pub accepted_by: Option<AckCandidate>,
}

impl AckOutcome {
    pub fn acknowledged(&self) -> bool {
        self.accepted_by.is_some()
    }
}

/// Device side of the backend HTTP API. Every call needs a [`BackendPermit`],
/// so no request can be issued while the radio is advertising.
pub struct BackendClient {
    http: Box<dyn HttpTransport>,
    memory: Box<dyn MemoryMonitor>,
    clock: Rc<dyn Clock>,
    base_url: String,
    device_key: String,
    key_header: String,
    ack_candidates: Vec<AckCandidate>,
    webhook_url: Option<String>,
    retry_backoff_ms: u64,
}

impl BackendClient {
    pub fn new(
        http: Box<dyn HttpTransport>,
        memory: Box<dyn MemoryMonitor>,
        clock: Rc<dyn Clock>,
        credentials: &Credentials,
        backend: &BackendConfig,
        agent: &AgentConfig,
    ) -> Self {
        Self {
            http,
            memory,
            clock,
            base_url: backend.base_url(&credentials.backend_host),
            device_key: credentials.device_key.clone(),
            key_header: backend.device_key_header.clone(),
            ack_candidates: backend.ack_candidates.clone(),
            webhook_url: backend.webhook_url.clone(),
            retry_backoff_ms: agent.memory_retry_backoff_ms,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn reclaim_memory(&mut self) {
        self.memory.reclaim();
    }

    /// Sends once, and once more after reclaiming memory if buffer
    /// allocation failed.
    fn send(
        &mut self,
        method: HttpMethod,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, AgentError> {
        let headers = [
            (self.key_header.as_str(), self.device_key.as_str()),
            ("Content-Type", "application/json"),
        ];
        let request = HttpRequest {
            method,
            url,
            headers: &headers,
            body,
        };

        match self.http.send(&request) {
            Err(TransportError::OutOfMemory) => {
                warn!(
                    "out of memory on {} {url} (free: {:?}), retrying",
                    method.as_str(),
                    self.memory.free_bytes()
                );
                self.memory.reclaim();
                self.clock.sleep_ms(self.retry_backoff_ms);
                Ok(self.http.send(&request)?)
            }
            other => Ok(other?),
        }
    }

    fn get_json<T: DeserializeOwned>(&mut self, path: &str) -> Result<T, AgentError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.send(HttpMethod::Get, &url, None)?;
        if response.status != 200 {
            return Err(AgentError::UnexpectedStatus {
                endpoint: path.to_string(),
                status: response.status,
            });
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    pub fn fetch_thresholds(
        &mut self,
        _permit: &BackendPermit<'_>,
    ) -> Result<ThresholdSet, AgentError> {
        let entries: Vec<ThresholdEntry> = self.get_json("/thresholds")?;
        Ok(ThresholdSet::from_entries(&entries))
    }

    pub fn fetch_commands(
        &mut self,
        _permit: &BackendPermit<'_>,
    ) -> Result<Vec<RawCommand>, AgentError> {
        let batch: Vec<serde_json::Value> = self.get_json("/commands")?;
        Ok(batch
            .into_iter()
            .filter_map(|element| {
                let command = RawCommand::from_value(element);
                if command.is_none() {
                    warn!("skipping malformed command entry");
                }
                command
            })
            .collect())
    }

    /// Posts one reading; returns the id the backend assigned, if any.
    pub fn post_sensor_data(
        &mut self,
        _permit: &BackendPermit<'_>,
        reading: &SensorReading,
    ) -> Result<Option<serde_json::Value>, AgentError> {
        let body = serde_json::to_vec(&SensorDataPayload::from(reading))?;
        let url = format!("{}/sensor-data", self.base_url);
        let response = self.send(HttpMethod::Post, &url, Some(&body))?;
        if response.status != 200 {
            return Err(AgentError::UnexpectedStatus {
                endpoint: "/sensor-data".to_string(),
                status: response.status,
            });
        }
        Ok(serde_json::from_slice::<SensorDataAccepted>(&response.body)
            .ok()
            .and_then(|accepted| accepted.sensor_data_id))
    }

    /// Walks the acknowledgment candidates in order and stops at the first
    /// 200/204. Failure of every candidate is logged, never raised.
    pub fn acknowledge(&mut self, _permit: &BackendPermit<'_>, id: &str) -> AckOutcome {
        let mut attempts = 0;
        for index in 0..self.ack_candidates.len() {
            let candidate = self.ack_candidates[index].clone();
            let url = format!("{}{}", self.base_url, candidate.render(id));
            attempts += 1;
            match self.send(candidate.method, &url, None) {
                Ok(response) if response.is_success() => {
                    debug!("command {id} acknowledged via {} {url}", candidate.method.as_str());
                    return AckOutcome {
                        attempts,
                        accepted_by: Some(candidate),
                    };
                }
                Ok(response) => debug!(
                    "ack {} {url} answered {}",
                    candidate.method.as_str(),
                    response.status
                ),
                Err(err) => debug!("ack {} {url} failed: {err}", candidate.method.as_str()),
            }
        }
        warn!("command {id} could not be acknowledged after {attempts} attempts");
        AckOutcome {
            attempts,
            accepted_by: None,
        }
    }

    pub fn alert_sink<'a, 'p>(&'a mut self, permit: &'a BackendPermit<'p>) -> WebhookSink<'a, 'p> {
        WebhookSink {
            client: self,
            _permit: permit,
        }
    }

    fn post_webhook(&mut self, alert: &ThresholdAlert) -> Result<(), AgentError> {
        let Some(url) = self.webhook_url.clone() else {
            debug!("no webhook configured; {} alert not sent", alert.metric);
            return Ok(());
        };
        let payload = WebhookPayload {
            alert_type: ALERT_TYPE_THRESHOLD,
            message: format!("{} threshold breached", alert.metric.label()),
            timestamp: chrono::Utc::now().timestamp(),
            metric: alert.metric,
            value: alert.value,
            unit: alert.metric.unit(),
        };
        let body = serde_json::to_vec(&payload)?;
        let response = self.send(HttpMethod::Post, &url, Some(&body))?;
        if !(200..300).contains(&response.status) {
            return Err(AgentError::UnexpectedStatus {
                endpoint: url,
                status: response.status,
            });
        }
        info!("{} alert sent ({})", alert.metric, alert.value);
        Ok(())
    }
}

/// Threshold notifications delivered through the outbound webhook.
pub struct WebhookSink<'a, 'p> {
    client: &'a mut BackendClient,
    _permit: &'a BackendPermit<'p>,
}

impl AlertSink for WebhookSink<'_, '_> {
    fn notify(&mut self, alert: &ThresholdAlert) -> Result<(), AgentError> {
        self.client.post_webhook(alert)
    }
}
