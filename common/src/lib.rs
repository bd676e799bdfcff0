pub mod agent;
pub mod backend;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod hal;
pub mod provisioning;
pub mod radio;
pub mod sensor_loop;
pub mod status;
pub mod telemetry;
pub mod thresholds;
pub mod types;

#[cfg(test)]
mod fakes;

pub use agent::{Agent, AgentIo};
pub use config::{AckCandidate, AckOrder, AgentConfig, BackendConfig, RuntimeConfig};
pub use credentials::{load_valid, CredentialError, CredentialStore, Credentials};
pub use error::{AgentError, ErrorKind, TransportError};
pub use provisioning::{run_provisioning, ProvisioningInbox, ProvisioningSession, ProvisioningState};
pub use radio::{BackendPermit, RadioArbiter};
pub use thresholds::{AlertDispatcher, ThresholdRange, ThresholdSet};
pub use types::{Button, MetricType, RadioMode, Rgb, SensorReading};
