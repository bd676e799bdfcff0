//! Ownership of the single radio. WiFi backend traffic and BLE advertising
//! never overlap: backend HTTP calls require a [`BackendPermit`], and a permit
//! can only be obtained while nothing is being advertised.

use std::marker::PhantomData;

use tracing::{debug, info, warn};

use crate::{error::AgentError, hal::BleBroadcaster, types::RadioMode};

/// Proof that the radio is available for backend traffic. Borrowing the
/// arbiter keeps any mode change from happening while the permit is alive.
#[derive(Debug)]
pub struct BackendPermit<'a> {
    _arbiter: PhantomData<&'a RadioArbiter>,
}

/// A temporary return of the radio to WiFi while broadcast mode is active.
#[derive(Debug, Clone, Copy)]
struct BackendWindow {
    resume_broadcast: bool,
}

pub struct RadioArbiter {
    ble: Box<dyn BleBroadcaster + Send>,
    device_name: String,
    mode: RadioMode,
    window: Option<BackendWindow>,
    advertising: bool,
}

impl RadioArbiter {
    pub fn new(ble: Box<dyn BleBroadcaster + Send>, device_name: impl Into<String>) -> Self {
        Self {
            ble,
            device_name: device_name.into(),
            mode: RadioMode::WifiBackend,
            window: None,
            advertising: false,
        }
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn in_backend_window(&self) -> bool {
        self.window.is_some()
    }

    pub fn backend_permit(&self) -> Option<BackendPermit<'_>> {
        let available = !self.advertising
            && (self.mode == RadioMode::WifiBackend || self.window.is_some());
        available.then_some(BackendPermit {
            _arbiter: PhantomData,
        })
    }

    /// Switches to BLE broadcast, advertising `payload`. Inside a backend
    /// window the request only decides what happens when the window closes.
    pub fn request_broadcast(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        if let Some(window) = self.window.as_mut() {
            window.resume_broadcast = true;
            return Ok(());
        }
        if self.mode == RadioMode::BleBroadcast {
            return Ok(());
        }

        if let Err(err) = self.ble.start_advertising(&self.device_name, payload) {
            self.ble.release();
            return Err(err);
        }
        self.advertising = true;
        self.mode = RadioMode::BleBroadcast;
        info!("radio switched to {}", self.mode);
        Ok(())
    }

    pub fn request_backend(&mut self) -> Result<(), AgentError> {
        if let Some(window) = self.window.as_mut() {
            window.resume_broadcast = false;
            return Ok(());
        }
        if self.mode == RadioMode::WifiBackend {
            return Ok(());
        }

        self.silence()?;
        self.mode = RadioMode::WifiBackend;
        info!("radio switched to {}", self.mode);
        Ok(())
    }

    pub fn toggle(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        let broadcasting = match self.window {
            Some(window) => window.resume_broadcast,
            None => self.mode == RadioMode::BleBroadcast,
        };
        if broadcasting {
            self.request_backend()
        } else {
            self.request_broadcast(payload)
        }
    }

    /// Lends the radio back to WiFi without leaving broadcast mode.
    pub fn open_backend_window(&mut self) -> Result<(), AgentError> {
        if self.mode != RadioMode::BleBroadcast || self.window.is_some() {
            return Err(AgentError::RadioBusy(self.mode));
        }
        self.silence()?;
        self.window = Some(BackendWindow {
            resume_broadcast: true,
        });
        debug!("backend window opened");
        Ok(())
    }

    /// Ends a backend window: resumes advertising `payload`, or settles in
    /// backend mode if a request inside the window asked for that.
    pub fn close_backend_window(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        let Some(window) = self.window.take() else {
            return Ok(());
        };
        debug!("backend window closed");

        if !window.resume_broadcast {
            self.mode = RadioMode::WifiBackend;
            info!("radio switched to {}", self.mode);
            return Ok(());
        }

        match self.ble.start_advertising(&self.device_name, payload) {
            Ok(()) => {
                self.advertising = true;
                Ok(())
            }
            Err(err) => {
                self.ble.release();
                self.mode = RadioMode::WifiBackend;
                warn!("could not resume broadcast, radio falls back to {}", self.mode);
                Err(err)
            }
        }
    }

    /// Replaces the advertised data while broadcasting.
    pub fn update_advertisement(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        if !self.advertising || self.window.is_some() {
            return Err(AgentError::RadioBusy(self.mode));
        }
        self.ble.start_advertising(&self.device_name, payload)
    }

    fn silence(&mut self) -> Result<(), AgentError> {
        if self.advertising {
            self.ble.stop_advertising()?;
            self.advertising = false;
        }
        self.ble.release();
        Ok(())
    }
}
