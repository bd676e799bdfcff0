//! Test doubles for the collaborator traits. State lives behind shared
//! handles so a test can keep a clone and inspect it after handing the fake
//! to the code under test.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    net::Ipv4Addr,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::{
    error::{AgentError, TransportError},
    hal::{
        BleBroadcaster, Buttons, Clock, Co2Sensor, Display, HttpMethod, HttpRequest, HttpResponse,
        HttpTransport, Indicator, LightSensor, MemoryMonitor, ProvisioningPeripheral, WifiStation,
    },
    thresholds::{AlertSink, ThresholdAlert},
    types::{Button, Rgb},
};

#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

/// Flags HTTP traffic that overlaps BLE advertising.
#[derive(Debug, Clone, Default)]
pub struct RadioProbe {
    state: Arc<ProbeState>,
}

#[derive(Debug, Default)]
struct ProbeState {
    advertising: AtomicBool,
    http_in_flight: AtomicU32,
    overlaps: AtomicU32,
}

impl RadioProbe {
    pub fn begin_http(&self) {
        if self.state.advertising.load(Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.state.http_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_http(&self) {
        self.state.http_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_advertising(&self, advertising: bool) {
        if advertising && self.state.http_in_flight.load(Ordering::SeqCst) > 0 {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.state.advertising.store(advertising, Ordering::SeqCst);
    }

    pub fn overlaps(&self) -> u32 {
        self.state.overlaps.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Timeout,
    OutOfMemory,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self::Status(200, body.to_string())
    }

    pub fn status(code: u16) -> Self {
        Self::Status(code, String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug)]
struct Route {
    method: HttpMethod,
    suffix: String,
    once: VecDeque<Reply>,
    standing: Option<Reply>,
}

#[derive(Debug, Default)]
struct HttpScript {
    routes: Vec<Route>,
    log: Vec<Recorded>,
}

impl HttpScript {
    fn route_mut(&mut self, method: HttpMethod, suffix: &str) -> &mut Route {
        let index = match self
            .routes
            .iter()
            .position(|route| route.method == method && route.suffix == suffix)
        {
            Some(index) => index,
            None => {
                self.routes.push(Route {
                    method,
                    suffix: suffix.to_string(),
                    once: VecDeque::new(),
                    standing: None,
                });
                self.routes.len() - 1
            }
        };
        &mut self.routes[index]
    }
}

/// Scripted transport. Requests are matched on method and URL suffix;
/// anything unscripted gets a 404.
#[derive(Debug, Clone, Default)]
pub struct FakeHttp {
    script: Rc<RefCell<HttpScript>>,
    probe: Option<RadioProbe>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(probe: RadioProbe) -> Self {
        Self {
            probe: Some(probe),
            ..Self::default()
        }
    }

    pub fn route(&self, method: HttpMethod, suffix: &str, reply: Reply) {
        self.script.borrow_mut().route_mut(method, suffix).standing = Some(reply);
    }

    pub fn route_once(&self, method: HttpMethod, suffix: &str, reply: Reply) {
        self.script
            .borrow_mut()
            .route_mut(method, suffix)
            .once
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.script.borrow().log.clone()
    }

    pub fn count(&self, method: HttpMethod, suffix: &str) -> usize {
        self.script
            .borrow()
            .log
            .iter()
            .filter(|request| request.method == method && request.url.ends_with(suffix))
            .count()
    }
}

impl HttpTransport for FakeHttp {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        if let Some(probe) = &self.probe {
            probe.begin_http();
        }

        let reply = {
            let mut script = self.script.borrow_mut();
            script.log.push(Recorded {
                method: request.method,
                url: request.url.to_string(),
                headers: request
                    .headers
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                body: request
                    .body
                    .map(|body| String::from_utf8_lossy(body).into_owned()),
            });
            script
                .routes
                .iter_mut()
                .find(|route| route.method == request.method && request.url.ends_with(&route.suffix))
                .and_then(|route| route.once.pop_front().or_else(|| route.standing.clone()))
                .unwrap_or_else(|| Reply::status(404))
        };

        if let Some(probe) = &self.probe {
            probe.end_http();
        }

        match reply {
            Reply::Status(status, body) => Ok(HttpResponse {
                status,
                body: body.into_bytes(),
            }),
            Reply::Timeout => Err(TransportError::Timeout),
            Reply::OutOfMemory => Err(TransportError::OutOfMemory),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeMemory {
    pub reclaims: Rc<Cell<u32>>,
}

impl MemoryMonitor for FakeMemory {
    fn free_bytes(&self) -> Option<usize> {
        Some(64 * 1024)
    }

    fn reclaim(&mut self) {
        self.reclaims.set(self.reclaims.get() + 1);
    }
}

#[derive(Debug, Default)]
pub struct WifiState {
    pub active: bool,
    pub linked: bool,
    pub pending: bool,
    pub activations: Vec<bool>,
    pub connect_calls: u32,
    /// `None` never links; `Some(n)` links on the n-th poll after connect.
    pub link_after_polls: Option<u32>,
    polls: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeWifi {
    pub state: Rc<RefCell<WifiState>>,
}

impl FakeWifi {
    pub fn reachable() -> Self {
        Self::after_polls(0)
    }

    pub fn after_polls(polls: u32) -> Self {
        let wifi = Self::default();
        wifi.state.borrow_mut().link_after_polls = Some(polls);
        wifi
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn drop_link(&self) {
        self.state.borrow_mut().linked = false;
    }
}

impl WifiStation for FakeWifi {
    fn set_active(&mut self, active: bool) -> Result<(), AgentError> {
        let mut state = self.state.borrow_mut();
        state.activations.push(active);
        state.active = active;
        if !active {
            state.linked = false;
            state.pending = false;
        }
        Ok(())
    }

    fn connect(&mut self, _ssid: &str, _password: &str) -> Result<(), AgentError> {
        let mut state = self.state.borrow_mut();
        if !state.active {
            return Err(AgentError::Radio("station inactive".into()));
        }
        state.connect_calls += 1;
        state.pending = true;
        state.polls = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.pending && !state.linked {
            let link_after_polls = state.link_after_polls;
            match link_after_polls {
                Some(needed) if state.polls >= needed => {
                    state.linked = true;
                    state.pending = false;
                }
                _ => state.polls += 1,
            }
        }
        state.linked
    }

    fn address(&self) -> Option<Ipv4Addr> {
        self.state
            .borrow()
            .linked
            .then(|| Ipv4Addr::new(192, 168, 1, 50))
    }
}

#[derive(Debug, Default)]
pub struct BleLog {
    pub advertising: bool,
    pub starts: u32,
    pub stops: u32,
    pub releases: u32,
    pub payloads: Vec<Vec<u8>>,
    pub fail_start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBle {
    log: Arc<Mutex<BleLog>>,
    probe: RadioProbe,
}

impl FakeBle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(probe: RadioProbe) -> Self {
        Self {
            log: Arc::default(),
            probe,
        }
    }

    pub fn log(&self) -> MutexGuard<'_, BleLog> {
        self.log.lock().unwrap()
    }
}

impl BleBroadcaster for FakeBle {
    fn start_advertising(&mut self, _device_name: &str, payload: &[u8]) -> Result<(), AgentError> {
        let mut log = self.log();
        if log.fail_start {
            return Err(AgentError::Radio("advertising rejected".into()));
        }
        log.starts += 1;
        log.payloads.push(payload.to_vec());
        log.advertising = true;
        self.probe.set_advertising(true);
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), AgentError> {
        let mut log = self.log();
        log.stops += 1;
        log.advertising = false;
        self.probe.set_advertising(false);
        Ok(())
    }

    fn release(&mut self) {
        let mut log = self.log();
        log.releases += 1;
        log.advertising = false;
        self.probe.set_advertising(false);
    }
}

#[derive(Debug, Default)]
pub struct FakePeripheral {
    pub advertise_calls: u32,
    pub shut_down: bool,
    pub fail_first_advertise: bool,
}

impl ProvisioningPeripheral for FakePeripheral {
    fn start_advertising(&mut self) -> Result<(), AgentError> {
        if self.fail_first_advertise {
            self.fail_first_advertise = false;
            return Err(AgentError::Radio("controller busy".into()));
        }
        self.advertise_calls += 1;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

#[derive(Debug)]
pub struct Co2State {
    pub ready: VecDeque<bool>,
    pub default_ready: bool,
    pub reading: (u16, f32, f32),
    pub fail_reads: u32,
    pub reinits: u32,
}

#[derive(Debug, Clone)]
pub struct FakeCo2 {
    pub state: Rc<RefCell<Co2State>>,
}

impl FakeCo2 {
    pub fn ready_with(co2: u16, temperature: f32, humidity: f32) -> Self {
        Self {
            state: Rc::new(RefCell::new(Co2State {
                ready: VecDeque::new(),
                default_ready: true,
                reading: (co2, temperature, humidity),
                fail_reads: 0,
                reinits: 0,
            })),
        }
    }

    pub fn never_ready() -> Self {
        let sensor = Self::ready_with(0, 0.0, 0.0);
        sensor.state.borrow_mut().default_ready = false;
        sensor
    }

    pub fn set_reading(&self, co2: u16, temperature: f32, humidity: f32) {
        self.state.borrow_mut().reading = (co2, temperature, humidity);
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.borrow_mut().fail_reads = count;
    }

    pub fn reinits(&self) -> u32 {
        self.state.borrow().reinits
    }
}

impl Co2Sensor for FakeCo2 {
    fn data_ready(&mut self) -> Result<bool, AgentError> {
        let mut state = self.state.borrow_mut();
        let default = state.default_ready;
        Ok(state.ready.pop_front().unwrap_or(default))
    }

    fn read(&mut self) -> Result<(u16, f32, f32), AgentError> {
        let mut state = self.state.borrow_mut();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(AgentError::Sensor("i2c read failed".into()));
        }
        Ok(state.reading)
    }

    fn reinit(&mut self) -> Result<(), AgentError> {
        self.state.borrow_mut().reinits += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeLight {
    pub level: Rc<Cell<Option<u16>>>,
}

impl FakeLight {
    pub fn reading(level: u16) -> Self {
        let light = Self::default();
        light.level.set(Some(level));
        light
    }
}

impl LightSensor for FakeLight {
    fn read(&mut self) -> Option<u16> {
        self.level.get()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    pub frames: Rc<RefCell<Vec<Vec<String>>>>,
}

impl RecordingDisplay {
    pub fn last(&self) -> Vec<String> {
        self.frames.borrow().last().cloned().unwrap_or_default()
    }
}

impl Display for RecordingDisplay {
    fn show(&mut self, lines: &[String]) {
        self.frames.borrow_mut().push(lines.to_vec());
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingIndicator {
    pub colors: Rc<RefCell<Vec<Rgb>>>,
}

impl RecordingIndicator {
    pub fn last(&self) -> Option<Rgb> {
        self.colors.borrow().last().copied()
    }
}

impl Indicator for RecordingIndicator {
    fn set_color(&mut self, color: Rgb) {
        self.colors.borrow_mut().push(color);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedButtons {
    pending: Rc<RefCell<Vec<Button>>>,
}

impl ScriptedButtons {
    pub fn press(&self, button: Button) {
        self.pending.borrow_mut().push(button);
    }
}

impl Buttons for ScriptedButtons {
    fn pressed(&mut self, button: Button) -> bool {
        let mut pending = self.pending.borrow_mut();
        match pending.iter().position(|candidate| *candidate == button) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub alerts: Vec<ThresholdAlert>,
    pub fail: bool,
}

impl AlertSink for RecordingSink {
    fn notify(&mut self, alert: &ThresholdAlert) -> Result<(), AgentError> {
        self.alerts.push(alert.clone());
        if self.fail {
            return Err(TransportError::Timeout.into());
        }
        Ok(())
    }
}
