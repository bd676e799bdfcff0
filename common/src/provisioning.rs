use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use tracing::{info, warn};

use crate::{
    credentials::{CredentialError, CredentialStore, Credentials},
    hal::{Clock, ProvisioningPeripheral},
};

pub const PROVISIONING_DEVICE_NAME: &str = "EG-SETUP";
pub const PROVISIONING_SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abc0001";
pub const PROVISIONING_CHARACTERISTIC_UUID: &str = "12345678-1234-5678-1234-56789abc0002";
pub const MAX_CREDENTIAL_PAYLOAD: usize = 512;
pub const MAX_PENDING_WRITES: usize = 8;
const ADVERTISING_RETRY_MS: u64 = 2_000;

/// Bounded FIFO hand-off between a radio-stack callback and the main loop.
/// When full, new values are refused so earlier ones are never lost.
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Mailbox<T> {
    pub const fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Returns `false` when the mailbox is full and the value was dropped.
    pub fn post(&self, value: T) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(value);
        true
    }

    /// Takes every pending value, oldest first.
    pub fn take_all(&self) -> Vec<T> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Everything the BLE stack callbacks are allowed to touch. Shared behind an
/// `Arc` between the callback context and the provisioning loop.
#[derive(Debug)]
pub struct ProvisioningInbox {
    connects: AtomicU32,
    disconnects: AtomicU32,
    writes: Mailbox<Vec<u8>>,
}

impl Default for ProvisioningInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningInbox {
    pub fn new() -> Self {
        Self {
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            writes: Mailbox::new(MAX_PENDING_WRITES),
        }
    }

    pub fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_write(&self, payload: &[u8]) {
        if payload.len() > MAX_CREDENTIAL_PAYLOAD {
            warn!(
                "dropping oversized provisioning write ({} bytes)",
                payload.len()
            );
            return;
        }
        if !self.writes.post(payload.to_vec()) {
            warn!("provisioning write queue full; dropping write");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Advertising,
    ClientConnected,
    CredentialsReceived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    Connected,
    Disconnected,
    Write(Vec<u8>),
}

#[derive(Debug)]
pub enum Transition {
    Unchanged,
    ClientConnected,
    ResumeAdvertising,
    Accepted(Credentials),
    Rejected(CredentialError),
}

#[derive(Debug)]
pub struct ProvisioningSession {
    state: ProvisioningState,
    seen_connects: u32,
    seen_disconnects: u32,
}

impl Default for ProvisioningSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningSession {
    pub fn new() -> Self {
        Self {
            state: ProvisioningState::Advertising,
            seen_connects: 0,
            seen_disconnects: 0,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn handle(&mut self, event: ProvisioningEvent) -> Transition {
        use ProvisioningState::*;

        match (self.state, event) {
            (CredentialsReceived, _) => Transition::Unchanged,
            (Advertising, ProvisioningEvent::Connected) => {
                self.state = ClientConnected;
                Transition::ClientConnected
            }
            (ClientConnected, ProvisioningEvent::Connected) => Transition::Unchanged,
            // Some stacks stop advertising on connect, so any disconnect
            // means advertising has to be restarted.
            (_, ProvisioningEvent::Disconnected) => {
                self.state = Advertising;
                Transition::ResumeAdvertising
            }
            (_, ProvisioningEvent::Write(payload)) => match Credentials::from_json(&payload) {
                Ok(credentials) => {
                    self.state = CredentialsReceived;
                    Transition::Accepted(credentials)
                }
                Err(err) => Transition::Rejected(err),
            },
        }
    }

    /// Collects callback activity since the previous drain, in the order a
    /// connection produces it. A reconnect that happened after the last
    /// disconnect is reported after that disconnect, so the session always
    /// ends on the current link state.
    pub fn drain(&mut self, inbox: &ProvisioningInbox) -> Vec<ProvisioningEvent> {
        let mut events = Vec::new();

        let connects = inbox.connects.load(Ordering::Acquire);
        let disconnects = inbox.disconnects.load(Ordering::Acquire);
        let new_connect = connects != self.seen_connects;
        let new_disconnect = disconnects != self.seen_disconnects;
        let linked = connects != disconnects;
        self.seen_connects = connects;
        self.seen_disconnects = disconnects;

        if new_connect {
            events.push(ProvisioningEvent::Connected);
        }
        events.extend(inbox.writes.take_all().into_iter().map(ProvisioningEvent::Write));
        if new_disconnect {
            events.push(ProvisioningEvent::Disconnected);
            if linked {
                events.push(ProvisioningEvent::Connected);
            }
        }

        events
    }

    /// Processes pending callback activity once. Returns the credentials after
    /// they were persisted; the peripheral is shut down at that point.
    pub fn step(
        &mut self,
        inbox: &ProvisioningInbox,
        peripheral: &mut dyn ProvisioningPeripheral,
        store: &mut dyn CredentialStore,
    ) -> Option<Credentials> {
        for event in self.drain(inbox) {
            match self.handle(event) {
                Transition::Unchanged => {}
                Transition::ClientConnected => info!("provisioning client connected"),
                Transition::ResumeAdvertising => {
                    info!("provisioning client disconnected; advertising again");
                    if let Err(err) = peripheral.start_advertising() {
                        warn!("failed to resume provisioning advertising: {err}");
                    }
                }
                Transition::Rejected(err) => {
                    warn!("ignoring provisioning write: {err}");
                }
                Transition::Accepted(credentials) => match store.save(&credentials) {
                    Ok(()) => {
                        info!("credentials received for ssid `{}`", credentials.ssid);
                        peripheral.shutdown();
                        return Some(credentials);
                    }
                    Err(err) => {
                        warn!("failed to persist credentials ({err}); waiting for a new write");
                        self.state = ProvisioningState::Advertising;
                        if let Err(err) = peripheral.start_advertising() {
                            warn!("failed to restart provisioning advertising: {err}");
                        }
                    }
                },
            }
        }
        None
    }
}

/// Blocks until a valid credential record has been written and persisted.
/// There is no timeout: the device waits for as long as it takes.
pub fn run_provisioning(
    inbox: &ProvisioningInbox,
    peripheral: &mut dyn ProvisioningPeripheral,
    store: &mut dyn CredentialStore,
    clock: &dyn Clock,
    poll_interval_ms: u64,
) -> Credentials {
    while let Err(err) = peripheral.start_advertising() {
        warn!("failed to start provisioning advertising: {err}");
        clock.sleep_ms(ADVERTISING_RETRY_MS);
    }
    info!("advertising as `{PROVISIONING_DEVICE_NAME}`; waiting for credentials");

    let mut session = ProvisioningSession::new();
    loop {
        if let Some(credentials) = session.step(inbox, peripheral, store) {
            return credentials;
        }
        clock.sleep_ms(poll_interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{
        credentials::MemoryCredentialStore,
        fakes::{FakeClock, FakePeripheral},
    };

    const VALID: &[u8] = br#"{"ssid":"home","password":"pw","backend_ip":"10.0.0.5","device_key":"k1"}"#;
    const MISSING_KEY: &[u8] = br#"{"ssid":"home","password":"pw","backend_ip":"10.0.0.5"}"#;

    #[test]
    fn complete_write_reaches_credentials_received() {
        let mut session = ProvisioningSession::new();

        let transition = session.handle(ProvisioningEvent::Write(VALID.to_vec()));

        assert!(matches!(transition, Transition::Accepted(_)));
        assert_eq!(session.state(), ProvisioningState::CredentialsReceived);
    }

    #[test]
    fn incomplete_write_leaves_state_unchanged() {
        let mut session = ProvisioningSession::new();

        let transition = session.handle(ProvisioningEvent::Write(MISSING_KEY.to_vec()));
        assert!(matches!(transition, Transition::Rejected(_)));
        assert_eq!(session.state(), ProvisioningState::Advertising);

        session.handle(ProvisioningEvent::Connected);
        session.handle(ProvisioningEvent::Write(b"{garbage".to_vec()));
        assert_eq!(session.state(), ProvisioningState::ClientConnected);
    }

    #[test]
    fn only_one_write_is_accepted() {
        let mut session = ProvisioningSession::new();
        session.handle(ProvisioningEvent::Write(VALID.to_vec()));

        let second = session.handle(ProvisioningEvent::Write(VALID.to_vec()));

        assert!(matches!(second, Transition::Unchanged));
    }

    #[test]
    fn disconnect_without_credentials_resumes_advertising() {
        let inbox = ProvisioningInbox::new();
        let mut peripheral = FakePeripheral::default();
        let mut store = MemoryCredentialStore::empty();
        let mut session = ProvisioningSession::new();

        inbox.on_connect();
        assert!(session.step(&inbox, &mut peripheral, &mut store).is_none());
        assert_eq!(session.state(), ProvisioningState::ClientConnected);

        inbox.on_write(MISSING_KEY);
        inbox.on_disconnect();
        assert!(session.step(&inbox, &mut peripheral, &mut store).is_none());

        assert_eq!(session.state(), ProvisioningState::Advertising);
        assert_eq!(peripheral.advertise_calls, 1);
        assert_eq!(store.saves, 0);
    }

    #[test]
    fn persistence_failure_returns_to_advertising() {
        let inbox = ProvisioningInbox::new();
        let mut peripheral = FakePeripheral::default();
        let mut store = MemoryCredentialStore::empty();
        store.fail_saves = 1;
        let mut session = ProvisioningSession::new();

        inbox.on_write(VALID);
        assert!(session.step(&inbox, &mut peripheral, &mut store).is_none());
        assert_eq!(session.state(), ProvisioningState::Advertising);
        assert_eq!(peripheral.advertise_calls, 1);
        assert!(!peripheral.shut_down);

        inbox.on_write(VALID);
        let credentials = session.step(&inbox, &mut peripheral, &mut store).unwrap();
        assert_eq!(credentials.device_key, "k1");
        assert_eq!(store.stored.as_ref(), Some(&credentials));
        assert!(peripheral.shut_down);
    }

    #[test]
    fn run_provisioning_waits_for_a_valid_write_from_another_context() {
        let inbox = Arc::new(ProvisioningInbox::new());
        let mut peripheral = FakePeripheral::default();
        peripheral.fail_first_advertise = true;
        let mut store = MemoryCredentialStore::empty();
        let clock = FakeClock::new();

        let producer = {
            let inbox = inbox.clone();
            thread::spawn(move || {
                inbox.on_connect();
                inbox.on_write(MISSING_KEY);
                inbox.on_write(VALID);
            })
        };
        producer.join().unwrap();

        let credentials = run_provisioning(&inbox, &mut peripheral, &mut store, &clock, 100);

        assert_eq!(credentials.ssid, "home");
        assert!(peripheral.shut_down);
        assert!(clock.now_ms() >= ADVERTISING_RETRY_MS);
    }

    #[test]
    fn mailbox_keeps_values_in_order_and_refuses_when_full() {
        let mailbox = Mailbox::new(2);

        assert!(mailbox.post(1));
        assert!(mailbox.post(2));
        assert!(!mailbox.post(3));
        assert_eq!(mailbox.take_all(), vec![1, 2]);
        assert!(mailbox.take_all().is_empty());
    }

    #[test]
    fn later_malformed_write_does_not_displace_valid_credentials() {
        let inbox = ProvisioningInbox::new();
        let mut peripheral = FakePeripheral::default();
        let mut store = MemoryCredentialStore::empty();
        let mut session = ProvisioningSession::new();

        inbox.on_connect();
        inbox.on_write(VALID);
        inbox.on_write(b"{garbage");

        let credentials = session.step(&inbox, &mut peripheral, &mut store);

        assert_eq!(credentials.map(|c| c.ssid), Some("home".to_string()));
        assert_eq!(session.state(), ProvisioningState::CredentialsReceived);
        assert_eq!(store.saves, 1);
        assert!(peripheral.shut_down);
    }

    #[test]
    fn reconnect_between_drains_ends_connected() {
        let inbox = ProvisioningInbox::new();
        let mut peripheral = FakePeripheral::default();
        let mut store = MemoryCredentialStore::empty();
        let mut session = ProvisioningSession::new();

        inbox.on_connect();
        inbox.on_disconnect();
        inbox.on_connect();
        assert!(session.step(&inbox, &mut peripheral, &mut store).is_none());

        assert_eq!(session.state(), ProvisioningState::ClientConnected);
        assert_eq!(peripheral.advertise_calls, 1);

        inbox.on_disconnect();
        assert_eq!(session.drain(&inbox), vec![ProvisioningEvent::Disconnected]);
    }

    #[test]
    fn oversized_writes_are_dropped() {
        let inbox = ProvisioningInbox::new();
        inbox.on_write(&vec![b'x'; MAX_CREDENTIAL_PAYLOAD + 1]);

        let mut session = ProvisioningSession::new();
        assert!(session.drain(&inbox).is_empty());
    }
}
