use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::AgentError;

/// Provisioning record. Every field must be non-empty for the record to be
/// usable; anything less is treated as absent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "backend_ip", default)]
    pub backend_host: String,
    #[serde(default)]
    pub device_key: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not a JSON credential object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
}

impl Credentials {
    pub fn from_json(payload: &[u8]) -> Result<Self, CredentialError> {
        let text = std::str::from_utf8(payload).map_err(|_| CredentialError::NotUtf8)?;
        let credentials: Credentials = serde_json::from_str(text.trim())?;
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn validate(&self) -> Result<(), CredentialError> {
        let fields = [
            ("ssid", &self.ssid),
            ("password", &self.password),
            ("backend_ip", &self.backend_host),
            ("device_key", &self.device_key),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(CredentialError::MissingField(name));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("backend_host", &self.backend_host)
            .field("device_key", &"<redacted>")
            .finish()
    }
}

pub trait CredentialStore {
    fn load(&mut self) -> Result<Option<Credentials>, AgentError>;
    fn save(&mut self, credentials: &Credentials) -> Result<(), AgentError>;
}

/// Loads the stored record, folding read errors and invalid records into
/// "absent" so the caller falls through to provisioning.
pub fn load_valid(store: &mut dyn CredentialStore) -> Option<Credentials> {
    match store.load() {
        Ok(Some(credentials)) if credentials.is_valid() => Some(credentials),
        Ok(Some(_)) => {
            warn!("stored credentials are incomplete; provisioning required");
            None
        }
        Ok(None) => None,
        Err(err) => {
            warn!("failed to load stored credentials: {err}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) struct MemoryCredentialStore {
    pub stored: Option<Credentials>,
    pub fail_saves: u32,
    pub saves: u32,
}

#[cfg(test)]
impl MemoryCredentialStore {
    pub fn empty() -> Self {
        Self {
            stored: None,
            fail_saves: 0,
            saves: 0,
        }
    }
}

#[cfg(test)]
impl CredentialStore for MemoryCredentialStore {
    fn load(&mut self) -> Result<Option<Credentials>, AgentError> {
        Ok(self.stored.clone())
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), AgentError> {
        self.saves += 1;
        if self.fail_saves > 0 {
            self.fail_saves -= 1;
            return Err(AgentError::Storage("flash write failed".into()));
        }
        self.stored = Some(credentials.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"ssid":"home","password":"hunter22","backend_ip":"10.0.0.5","device_key":"demo-device-key"}"#;

    #[test]
    fn parses_complete_record() {
        let credentials = Credentials::from_json(VALID.as_bytes()).unwrap();

        assert_eq!(credentials.ssid, "home");
        assert_eq!(credentials.backend_host, "10.0.0.5");
    }

    #[test]
    fn rejects_missing_or_blank_fields() {
        let missing = br#"{"ssid":"home","password":"x","backend_ip":"10.0.0.5"}"#;
        let blank = br#"{"ssid":" ","password":"x","backend_ip":"h","device_key":"k"}"#;

        assert!(matches!(
            Credentials::from_json(missing),
            Err(CredentialError::MissingField("device_key"))
        ));
        assert!(matches!(
            Credentials::from_json(blank),
            Err(CredentialError::MissingField("ssid"))
        ));
        assert!(matches!(
            Credentials::from_json(b"not json"),
            Err(CredentialError::Json(_))
        ));
        assert!(matches!(
            Credentials::from_json(&[0xff, 0xfe]),
            Err(CredentialError::NotUtf8)
        ));
    }

    #[test]
    fn incomplete_stored_record_counts_as_absent() {
        let mut store = MemoryCredentialStore::empty();
        store.stored = Some(Credentials {
            ssid: "home".into(),
            password: String::new(),
            backend_host: "h".into(),
            device_key: "k".into(),
        });

        assert!(load_valid(&mut store).is_none());

        store.stored = Some(Credentials::from_json(VALID.as_bytes()).unwrap());
        assert!(load_valid(&mut store).is_some());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let credentials = Credentials::from_json(VALID.as_bytes()).unwrap();
        let rendered = format!("{credentials:?}");

        assert!(!rendered.contains("hunter22"));
        assert!(!rendered.contains("demo-device-key"));
    }
}
