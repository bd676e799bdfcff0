use std::{
    io::BufRead,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use ecoguard_common::{
    error::TransportError,
    hal::{
        BleBroadcaster, Buttons, Clock, Co2Sensor, Display, HttpMethod, HttpRequest, HttpResponse,
        HttpTransport, Indicator, LightSensor, MemoryMonitor, ProvisioningPeripheral, WifiStation,
    },
    load_valid,
    provisioning::PROVISIONING_DEVICE_NAME,
    run_provisioning, Agent, AgentError, AgentIo, Button, CredentialStore, Credentials,
    ProvisioningInbox, Rgb, RuntimeConfig,
};

const DEFAULT_CREDENTIALS_PATH: &str = "ecoguard-credentials.json";
const DEFAULT_PROVISION_PORT: u16 = 7878;
const PROVISIONING_POLL_MS: u64 = 100;

enum Boot {
    Stored(Credentials),
    Provision(TcpPeripheral),
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config()?;

    let credentials_path = std::env::var("ECOGUARD_CREDENTIALS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CREDENTIALS_PATH));
    let mut store = FileCredentialStore::new(credentials_path);
    let stored = load_valid(&mut store);

    let inbox = Arc::new(ProvisioningInbox::new());
    let boot = match stored {
        Some(credentials) => Boot::Stored(credentials),
        None => {
            let addr = std::env::var("ECOGUARD_PROVISION_ADDR")
                .ok()
                .and_then(|value| value.parse::<SocketAddr>().ok())
                .unwrap_or(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PROVISION_PORT)));
            Boot::Provision(spawn_provisioning_listener(addr, inbox.clone()).await?)
        }
    };

    let _agent = thread::Builder::new()
        .name("agent".to_string())
        .spawn(move || {
            let credentials = match boot {
                Boot::Stored(credentials) => credentials,
                Boot::Provision(mut peripheral) => run_provisioning(
                    &inbox,
                    &mut peripheral,
                    &mut store,
                    &HostClock,
                    PROVISIONING_POLL_MS,
                ),
            };
            run_agent(&runtime, credentials)
        })
        .context("failed to spawn agent thread")?;

    info!("simulated device started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

fn run_agent(runtime: &RuntimeConfig, credentials: Credentials) {
    let http = match ReqwestTransport::new(runtime.backend.request_timeout_ms) {
        Ok(http) => http,
        Err(err) => {
            warn!("failed to build http client: {err:#}");
            return;
        }
    };

    let io = AgentIo {
        clock: Rc::new(HostClock),
        http: Box::new(http),
        memory: Box::new(HostMemory),
        wifi: Box::new(SimulatedWifi::default()),
        ble: Box::new(LoggingBroadcaster::default()),
        co2: Some(Box::new(SimulatedCo2::default())),
        light: Some(Box::new(SimulatedLight::default())),
        display: Box::new(LoggingDisplay),
        indicator: Box::new(LoggingIndicator),
        buttons: Box::new(ConsoleButtons::spawn()),
    };

    let mut agent = Agent::new(runtime, credentials, io);
    agent.start();
    agent.run_forever()
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let mut runtime = match std::env::var("ECOGUARD_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read runtime config `{path}`"))?;
            serde_json::from_str::<RuntimeConfig>(&text)
                .with_context(|| format!("failed to parse runtime config `{path}`"))?
        }
        Err(_) => RuntimeConfig::default(),
    };

    if let Some(port) = std::env::var("BACKEND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.backend.port = port;
    }
    if let Ok(url) = std::env::var("WEBHOOK_URL") {
        runtime.backend.webhook_url = Some(url);
    }

    runtime.sanitize();
    Ok(runtime)
}

/// Credentials persisted as a JSON file, standing in for flash storage.
struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&mut self) -> Result<Option<Credentials>, AgentError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AgentError::Storage(format!(
                    "{}: {err}",
                    self.path.display()
                )))
            }
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), AgentError> {
        let payload = serde_json::to_string_pretty(credentials)?;
        std::fs::write(&self.path, payload)
            .map_err(|err| AgentError::Storage(format!("{}: {err}", self.path.display())))
    }
}

/// Binds the TCP stand-in for the BLE provisioning service. A TCP connection
/// is a BLE connection; every received line is one characteristic write.
async fn spawn_provisioning_listener(
    addr: SocketAddr,
    inbox: Arc<ProvisioningInbox>,
) -> anyhow::Result<TcpPeripheral> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning listener on {addr}"))?;

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("provisioning connection from {peer}");
                    serve_provisioning_client(stream, &inbox).await;
                }
                Err(err) => {
                    warn!("provisioning accept failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    Ok(TcpPeripheral {
        addr,
        listener: Some(task.abort_handle()),
    })
}

async fn serve_provisioning_client(stream: TcpStream, inbox: &ProvisioningInbox) {
    inbox.on_connect();
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => inbox.on_write(line.as_bytes()),
            Ok(None) => break,
            Err(err) => {
                warn!("provisioning connection error: {err}");
                break;
            }
        }
    }
    inbox.on_disconnect();
}

struct TcpPeripheral {
    addr: SocketAddr,
    listener: Option<AbortHandle>,
}

impl ProvisioningPeripheral for TcpPeripheral {
    fn start_advertising(&mut self) -> Result<(), AgentError> {
        if self.listener.is_none() {
            return Err(AgentError::Radio("provisioning listener is shut down".into()));
        }
        info!(
            "`{PROVISIONING_DEVICE_NAME}` accepting credentials on {}",
            self.addr
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

struct HostClock;

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    fn new(timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(request.url),
            HttpMethod::Post => self.client.post(request.url),
            HttpMethod::Put => self.client.put(request.url),
        };
        for (name, value) in request.headers {
            builder = builder.header(*name, *value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(transport_error)?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

struct HostMemory;

impl MemoryMonitor for HostMemory {
    fn free_bytes(&self) -> Option<usize> {
        None
    }

    fn reclaim(&mut self) {}
}

/// The host network is always there; the station only tracks whether the
/// agent has it switched on.
#[derive(Default)]
struct SimulatedWifi {
    active: bool,
    connected: bool,
}

impl WifiStation for SimulatedWifi {
    fn set_active(&mut self, active: bool) -> Result<(), AgentError> {
        self.active = active;
        if !active {
            self.connected = false;
        }
        Ok(())
    }

    fn connect(&mut self, ssid: &str, _password: &str) -> Result<(), AgentError> {
        if !self.active {
            return Err(AgentError::Radio("station is inactive".into()));
        }
        info!("joined simulated network `{ssid}`");
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn address(&self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::LOCALHOST)
    }
}

#[derive(Default)]
struct LoggingBroadcaster {
    advertising: bool,
}

impl BleBroadcaster for LoggingBroadcaster {
    fn start_advertising(&mut self, device_name: &str, payload: &[u8]) -> Result<(), AgentError> {
        self.advertising = true;
        info!(
            "[BLE] `{device_name}` advertising `{}`",
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), AgentError> {
        if self.advertising {
            info!("[BLE] advertising stopped");
        }
        self.advertising = false;
        Ok(())
    }

    fn release(&mut self) {
        debug!("[BLE] stack released");
    }
}

/// Drifting SCD41-like readings.
#[derive(Default)]
struct SimulatedCo2 {
    samples: u32,
}

impl Co2Sensor for SimulatedCo2 {
    fn data_ready(&mut self) -> Result<bool, AgentError> {
        Ok(true)
    }

    fn read(&mut self) -> Result<(u16, f32, f32), AgentError> {
        self.samples = self.samples.wrapping_add(1);
        let step = self.samples % 12;
        let co2 = 550 + step as u16 * 40;
        let temperature = 21.0 + (self.samples % 8) as f32 * 0.4;
        let humidity = 40.0 + (self.samples % 6) as f32 * 1.5;
        Ok((co2, temperature, humidity))
    }

    fn reinit(&mut self) -> Result<(), AgentError> {
        info!("[SCD41] periodic measurement restarted");
        Ok(())
    }
}

#[derive(Default)]
struct SimulatedLight {
    samples: u16,
}

impl LightSensor for SimulatedLight {
    fn read(&mut self) -> Option<u16> {
        self.samples = self.samples.wrapping_add(1);
        Some(300 + (self.samples % 10) * 25)
    }
}

struct LoggingDisplay;

impl Display for LoggingDisplay {
    fn show(&mut self, lines: &[String]) {
        info!("[LCD] {}", lines.join(" | "));
    }
}

struct LoggingIndicator;

impl Indicator for LoggingIndicator {
    fn set_color(&mut self, color: Rgb) {
        debug!("[LED] ({}, {}, {})", color.r, color.g, color.b);
    }
}

/// Typing `a`, `b` or `c` on stdin presses the matching button.
struct ConsoleButtons {
    pressed: Arc<[AtomicBool; 3]>,
}

impl ConsoleButtons {
    fn spawn() -> Self {
        let pressed: Arc<[AtomicBool; 3]> = Arc::new(Default::default());
        let reader = pressed.clone();
        let spawned = thread::Builder::new()
            .name("buttons".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    match line.trim().to_ascii_lowercase().as_str() {
                        "a" => reader[0].store(true, Ordering::Release),
                        "b" => reader[1].store(true, Ordering::Release),
                        "c" => reader[2].store(true, Ordering::Release),
                        _ => {}
                    }
                }
            });
        if let Err(err) = spawned {
            warn!("console buttons unavailable: {err}");
        }
        Self { pressed }
    }
}

impl Buttons for ConsoleButtons {
    fn pressed(&mut self, button: Button) -> bool {
        let index = match button {
            Button::A => 0,
            Button::B => 1,
            Button::C => 2,
        };
        self.pressed[index].swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ecoguard-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn file_store_round_trips_and_reports_absence() {
        let path = temp_path("store");
        let _ = std::fs::remove_file(&path);
        let mut store = FileCredentialStore::new(path.clone());

        assert!(store.load().unwrap().is_none());

        let credentials = Credentials {
            ssid: "home".into(),
            password: "hunter22".into(),
            backend_host: "10.0.0.5".into(),
            device_key: "key".into(),
        };
        store.save(&credentials).unwrap();

        assert_eq!(store.load().unwrap(), Some(credentials));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{not json").unwrap();
        let mut store = FileCredentialStore::new(path.clone());

        assert!(store.load().is_err());
        assert!(load_valid(&mut store).is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn simulated_station_needs_activation() {
        let mut wifi = SimulatedWifi::default();

        assert!(wifi.connect("home", "pw").is_err());
        wifi.set_active(true).unwrap();
        wifi.connect("home", "pw").unwrap();
        assert_eq!(wifi.address(), Some(Ipv4Addr::LOCALHOST));

        wifi.set_active(false).unwrap();
        assert!(!wifi.is_connected());
    }

    #[tokio::test]
    async fn tcp_lines_become_provisioning_writes() {
        use ecoguard_common::provisioning::{ProvisioningEvent, ProvisioningSession};
        use tokio::io::AsyncWriteExt;

        let inbox = ProvisioningInbox::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"{\"ssid\":\"home\",\"password\":\"pw\",\"backend_ip\":\"h\",\"device_key\":\"k\"}\n")
                .await
                .unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        serve_provisioning_client(stream, &inbox).await;
        client.await.unwrap();

        let mut session = ProvisioningSession::new();
        assert_eq!(
            session.drain(&inbox),
            vec![
                ProvisioningEvent::Connected,
                ProvisioningEvent::Write(
                    br#"{"ssid":"home","password":"pw","backend_ip":"h","device_key":"k"}"#.to_vec()
                ),
                ProvisioningEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn shut_down_peripheral_stops_advertising() {
        let mut peripheral = TcpPeripheral {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PROVISION_PORT)),
            listener: None,
        };

        assert!(peripheral.start_advertising().is_err());
    }
}
