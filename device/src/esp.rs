use core::convert::TryInto;
use std::{
    cell::RefCell,
    net::Ipv4Addr,
    rc::Rc,
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_hal::i2c::I2c;
use embedded_hal_bus::i2c::RefCellDevice;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    bt::{
        ble::{
            gap::{AdvConfiguration, EspBleGap},
            gatt::{
                server::{EspGatts, GattsEvent},
                AutoResponse, GattCharacteristic, GattId, GattServiceId, Handle, Permission,
                Property,
            },
        },
        Ble, BtDriver, BtUuid,
    },
    eventloop::EspSystemEventLoop,
    hal::{
        adc::{
            attenuation::DB_11,
            oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
            ADC1,
        },
        delay::FreeRtos,
        gpio::{AnyIOPin, Gpio34, IOPin, Input, PinDriver, Pull},
        i2c::{I2cConfig, I2cDriver},
        modem::BluetoothModem,
        peripheral::Peripheral,
        prelude::Peripherals,
        rmt::{config::TransmitConfig, FixedLengthSignal, PinState, Pulse, TxRmtDriver},
        units::FromValueType,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use ecoguard_common::{
    error::TransportError,
    hal::{
        BleBroadcaster, Buttons, Clock, Co2Sensor, Display, HttpMethod, HttpRequest, HttpResponse,
        HttpTransport, Indicator, LightSensor, MemoryMonitor, ProvisioningPeripheral, WifiStation,
    },
    load_valid,
    provisioning::{
        PROVISIONING_CHARACTERISTIC_UUID, PROVISIONING_DEVICE_NAME, PROVISIONING_SERVICE_UUID,
        MAX_CREDENTIAL_PAYLOAD,
    },
    run_provisioning, Agent, AgentError, AgentIo, Button, CredentialStore, Credentials,
    ProvisioningInbox, Rgb, RuntimeConfig,
};

const NVS_NAMESPACE: &str = "ecoguard";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_CREDENTIALS_KEY: &str = "creds_json";
const MAX_HTTP_BODY: usize = 8192;
// Acknowledgment fallback can chain several request timeouts back to back.
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const PROVISIONING_POLL_MS: u64 = 100;
const GATT_APP_ID: u16 = 0;
const GATT_SERVICE_HANDLES: u8 = 8;
// Test/unassigned company id; the payload follows it in the manufacturer field.
const MANUFACTURER_ID: [u8; 2] = [0xff, 0xff];
const BUTTON_DEBOUNCE_MS: u64 = 80;
const I2C_BAUDRATE_KHZ: u32 = 50;
const SCD41_ADDRESS: u8 = 0x62;
const SSD1306_LINE_HEIGHT: i32 = 11;

type SharedI2c = RefCellDevice<'static, I2cDriver<'static>>;
type BleGap = EspBleGap<'static, Ble, Arc<BtDriver<'static, Ble>>>;
type BleGatts = EspGatts<'static, Ble, Arc<BtDriver<'static, Ble>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let Peripherals {
        modem,
        pins,
        i2c0,
        adc1,
        rmt,
        ..
    } = Peripherals::take()?;
    let (wifi_modem, mut bt_modem) = modem.split();

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio23,
        pins.gpio22,
        &I2cConfig::new().baudrate(I2C_BAUDRATE_KHZ.kHz().into()),
    )
    .context("failed to initialize I2C bus")?;
    let bus: &'static RefCell<I2cDriver<'static>> = Box::leak(Box::new(RefCell::new(i2c)));

    let mut display: Box<dyn Display> = match OledDisplay::new(RefCellDevice::new(bus)) {
        Ok(display) => Box::new(display),
        Err(err) => {
            warn!("OLED unavailable: {err:#}");
            Box::new(LogDisplay)
        }
    };
    display.show(&["EcoGuard".to_string()]);

    let indicator: Box<dyn Indicator> = match NeoPixel::new(rmt.channel0, pins.gpio5) {
        Ok(pixel) => Box::new(pixel),
        Err(err) => {
            warn!("RGB LED unavailable: {err:#}");
            Box::new(LogIndicator)
        }
    };

    let mut store = nvs_store.clone();
    let credentials = match load_valid(&mut store) {
        Some(credentials) => credentials,
        None => {
            display.show(&[
                "Setup mode".to_string(),
                PROVISIONING_DEVICE_NAME.to_string(),
            ]);
            provision(&mut bt_modem, &nvs_partition, &mut store)?
        }
    };

    let co2: Option<Box<dyn Co2Sensor>> = match Scd41::start(RefCellDevice::new(bus)) {
        Ok(sensor) => Some(Box::new(sensor)),
        Err(err) => {
            warn!("SCD41 init failed: {err}");
            None
        }
    };
    let light: Option<Box<dyn LightSensor>> = match AdcLight::new(adc1, pins.gpio34) {
        Ok(sensor) => Some(Box::new(sensor)),
        Err(err) => {
            warn!("light sensor unavailable: {err:#}");
            None
        }
    };

    let esp_wifi = EspWifi::new(wifi_modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let buttons = PinButtons::new([
        pins.gpio15.downgrade(),
        pins.gpio32.downgrade(),
        pins.gpio14.downgrade(),
    ])
    .context("failed to configure buttons")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let io = AgentIo {
        clock: Rc::new(EspClock),
        http: Box::new(EspHttpTransport::new(runtime.backend.request_timeout_ms)),
        memory: Box::new(HeapMonitor),
        wifi: Box::new(EspStation { wifi }),
        ble: Box::new(GapBroadcaster::new(bt_modem, nvs_partition)),
        co2,
        light,
        display,
        indicator,
        buttons: Box::new(buttons),
    };

    let mut agent = Agent::new(&runtime, credentials, io);
    feed_watchdog();
    agent.start();

    loop {
        feed_watchdog();
        if let Err(err) = agent.tick() {
            agent.recover(err);
        }
        thread::sleep(Duration::from_millis(runtime.agent.tick_interval_ms));
    }
}

fn provision(
    modem: &mut BluetoothModem,
    nvs_partition: &EspDefaultNvsPartition,
    store: &mut NvsStore,
) -> anyhow::Result<Credentials> {
    let inbox = Arc::new(ProvisioningInbox::new());
    // The driver owns a copy of the modem only until provisioning completes.
    let driver = BtDriver::new(
        unsafe { modem.clone_unchecked() },
        Some(nvs_partition.clone()),
    )
    .context("failed to start bluetooth for provisioning")?;
    let mut peripheral = GattProvisioning::new(Arc::new(driver), inbox.clone())?;

    let credentials = run_provisioning(
        &inbox,
        &mut peripheral,
        store,
        &EspClock,
        PROVISIONING_POLL_MS,
    );
    drop(peripheral);
    Ok(credentials)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn nvs(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, AgentError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| AgentError::Storage(format!("open `{NVS_NAMESPACE}`: {err}")))
    }
}

impl CredentialStore for NvsStore {
    fn load(&mut self) -> Result<Option<Credentials>, AgentError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.nvs()?;
        let mut buffer = vec![0_u8; 1024];

        match nvs.get_str(NVS_CREDENTIALS_KEY, &mut buffer) {
            Ok(Some(value)) => Ok(Some(serde_json::from_str::<Credentials>(value)?)),
            Ok(None) => Ok(None),
            Err(err) => Err(AgentError::Storage(format!("read credentials: {err}"))),
        }
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), AgentError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.nvs()?;
        let payload = serde_json::to_string(credentials)?;
        nvs.set_str(NVS_CREDENTIALS_KEY, &payload)
            .map_err(|err| AgentError::Storage(format!("write credentials: {err}")))
    }
}

fn uuid128(text: &str) -> anyhow::Result<BtUuid> {
    let hex: String = text.chars().filter(|c| *c != '-').collect();
    let value = u128::from_str_radix(&hex, 16).with_context(|| format!("invalid UUID `{text}`"))?;
    Ok(BtUuid::uuid128(value))
}

/// GATT server exposing the single credential characteristic. Callback
/// activity is handed to the provisioning loop through the inbox.
struct GattProvisioning {
    gap: BleGap,
    gatts: Arc<BleGatts>,
    service_uuid: BtUuid,
}

impl GattProvisioning {
    fn new(
        driver: Arc<BtDriver<'static, Ble>>,
        inbox: Arc<ProvisioningInbox>,
    ) -> anyhow::Result<Self> {
        let gap = EspBleGap::new(driver.clone())?;
        let gatts = Arc::new(EspGatts::new(driver)?);
        let service_uuid = uuid128(PROVISIONING_SERVICE_UUID)?;
        let characteristic_uuid = uuid128(PROVISIONING_CHARACTERISTIC_UUID)?;

        let server: Weak<BleGatts> = Arc::downgrade(&gatts);
        let characteristic: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
        let registered_service = service_uuid.clone();
        gatts.subscribe(move |(gatt_if, event)| {
            let Some(gatts) = server.upgrade() else {
                return;
            };
            match event {
                GattsEvent::ServiceRegistered { app_id, .. } if app_id == GATT_APP_ID => {
                    let service = GattServiceId {
                        id: GattId {
                            uuid: registered_service.clone(),
                            inst_id: 0,
                        },
                        is_primary: true,
                    };
                    if let Err(err) =
                        gatts.create_service(gatt_if, &service, GATT_SERVICE_HANDLES)
                    {
                        warn!("failed to create provisioning service: {err}");
                    }
                }
                GattsEvent::ServiceCreated { service_handle, .. } => {
                    let result = gatts.start_service(service_handle).and_then(|_| {
                        gatts.add_characteristic(
                            service_handle,
                            &GattCharacteristic {
                                uuid: characteristic_uuid.clone(),
                                permissions: Permission::Read | Permission::Write,
                                properties: Property::Read
                                    | Property::Write
                                    | Property::WriteNoResponse,
                                max_len: MAX_CREDENTIAL_PAYLOAD,
                                auto_rsp: AutoResponse::ByGatt,
                            },
                            &[],
                        )
                    });
                    if let Err(err) = result {
                        warn!("failed to publish provisioning characteristic: {err}");
                    }
                }
                GattsEvent::CharacteristicAdded { attr_handle, .. } => {
                    *characteristic.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(attr_handle);
                }
                GattsEvent::PeerConnected { .. } => inbox.on_connect(),
                GattsEvent::PeerDisconnected { .. } => inbox.on_disconnect(),
                GattsEvent::Write { handle, value, .. } => {
                    let expected = *characteristic.lock().unwrap_or_else(PoisonError::into_inner);
                    if expected == Some(handle) {
                        inbox.on_write(value);
                    }
                }
                _ => {}
            }
        })?;
        gatts.register_app(GATT_APP_ID)?;

        Ok(Self {
            gap,
            gatts,
            service_uuid,
        })
    }
}

impl ProvisioningPeripheral for GattProvisioning {
    fn start_advertising(&mut self) -> Result<(), AgentError> {
        let radio = |err: EspError| AgentError::Radio(err.to_string());
        self.gap
            .set_device_name(PROVISIONING_DEVICE_NAME)
            .map_err(radio)?;
        self.gap
            .set_adv_conf(&AdvConfiguration {
                include_name: true,
                flag: 0x06,
                service_uuid: Some(self.service_uuid.clone()),
                ..Default::default()
            })
            .map_err(radio)?;
        self.gap.start_advertising().map_err(radio)
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.gap.stop_advertising() {
            warn!("failed to stop provisioning advertising: {err}");
        }
        if let Err(err) = self.gatts.unsubscribe() {
            warn!("failed to detach provisioning callbacks: {err}");
        }
    }
}

/// Advertises sensor payloads as manufacturer data. The bluetooth driver only
/// exists while broadcasting; `release` drops it so WiFi has the radio.
struct GapBroadcaster {
    modem: BluetoothModem,
    nvs: EspDefaultNvsPartition,
    gap: Option<BleGap>,
    advertising: bool,
}

impl GapBroadcaster {
    fn new(modem: BluetoothModem, nvs: EspDefaultNvsPartition) -> Self {
        Self {
            modem,
            nvs,
            gap: None,
            advertising: false,
        }
    }

    fn gap(&mut self) -> Result<&BleGap, EspError> {
        let gap = match self.gap.take() {
            Some(gap) => gap,
            None => {
                let driver = BtDriver::new(
                    unsafe { self.modem.clone_unchecked() },
                    Some(self.nvs.clone()),
                )?;
                EspBleGap::new(Arc::new(driver))?
            }
        };
        let gap: &BleGap = self.gap.insert(gap);
        Ok(gap)
    }
}

impl BleBroadcaster for GapBroadcaster {
    fn start_advertising(&mut self, device_name: &str, payload: &[u8]) -> Result<(), AgentError> {
        let radio = |err: EspError| AgentError::Radio(err.to_string());
        let mut manufacturer = MANUFACTURER_ID.to_vec();
        manufacturer.extend_from_slice(payload);
        let advertising = self.advertising;

        let gap = self.gap().map_err(radio)?;
        gap.set_device_name(device_name).map_err(radio)?;
        gap.set_adv_conf(&AdvConfiguration {
            flag: 0x06,
            manufacturer_data: Some(&manufacturer),
            ..Default::default()
        })
        .map_err(radio)?;
        gap.set_adv_conf(&AdvConfiguration {
            set_scan_rsp: true,
            include_name: true,
            ..Default::default()
        })
        .map_err(radio)?;
        if !advertising {
            gap.start_advertising().map_err(radio)?;
        }
        self.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), AgentError> {
        if let (true, Some(gap)) = (self.advertising, self.gap.as_ref()) {
            gap.stop_advertising()
                .map_err(|err| AgentError::Radio(err.to_string()))?;
        }
        self.advertising = false;
        Ok(())
    }

    fn release(&mut self) {
        self.advertising = false;
        self.gap = None;
    }
}

struct EspStation {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiStation for EspStation {
    fn set_active(&mut self, active: bool) -> Result<(), AgentError> {
        let started = self.wifi.is_started().unwrap_or(false);
        let result = match (active, started) {
            (true, false) => self.wifi.start(),
            (false, true) => {
                let _ = self.wifi.disconnect();
                self.wifi.stop()
            }
            _ => Ok(()),
        };
        result.map_err(|err| AgentError::Radio(format!("wifi set_active({active}): {err}")))?;
        if active {
            disable_wifi_power_save();
        }
        Ok(())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), AgentError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| AgentError::Radio("wifi ssid too long".into()))?,
            password: password
                .try_into()
                .map_err(|_| AgentError::Radio("wifi password too long".into()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| AgentError::Radio(format!("wifi configuration: {err}")))?;
        // Non-blocking; the connectivity manager polls for the link.
        self.wifi
            .wifi_mut()
            .connect()
            .map_err(|err| AgentError::Radio(format!("wifi connect: {err}")))
    }

    fn is_connected(&self) -> bool {
        is_wifi_station_connected() && self.wifi.wifi().sta_netif().is_up().unwrap_or(false)
    }

    fn address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }
}

struct EspHttpTransport {
    timeout: Duration,
}

impl EspHttpTransport {
    fn new(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl HttpTransport for EspHttpTransport {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let config = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(transport_error)?;
        let mut client = HttpClient::wrap(connection);

        let method = match request.method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
        };
        let length = request.body.map(|body| body.len().to_string());
        let mut headers = request.headers.to_vec();
        if let Some(length) = length.as_deref() {
            headers.push(("Content-Length", length));
        }

        let mut outgoing = client
            .request(method, request.url, &headers)
            .map_err(|err| transport_error(err.0))?;
        if let Some(body) = request.body {
            outgoing
                .write_all(body)
                .map_err(|err| transport_error(err.0))?;
            outgoing.flush().map_err(|err| transport_error(err.0))?;
        }
        let mut response = outgoing.submit().map_err(|err| transport_error(err.0))?;

        let status = response.status();
        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| transport_error(err.0))?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_HTTP_BODY {
                return Err(TransportError::Io(format!(
                    "response body exceeds {MAX_HTTP_BODY} bytes"
                )));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse { status, body })
    }
}

fn transport_error(err: EspError) -> TransportError {
    let code = err.code();
    if code == sys::ESP_ERR_NO_MEM as sys::esp_err_t {
        TransportError::OutOfMemory
    } else if code == sys::ESP_ERR_TIMEOUT as sys::esp_err_t
        || code == sys::ESP_ERR_HTTP_EAGAIN as sys::esp_err_t
    {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

struct HeapMonitor;

impl MemoryMonitor for HeapMonitor {
    fn free_bytes(&self) -> Option<usize> {
        Some(unsafe { sys::esp_get_free_heap_size() } as usize)
    }

    fn reclaim(&mut self) {
        // Request buffers are dropped before the retry; report what that freed.
        info!(
            "free heap {} bytes (min {})",
            unsafe { sys::esp_get_free_heap_size() },
            unsafe { sys::esp_get_minimum_free_heap_size() }
        );
    }
}

/// SCD41 over the raw I2C command set.
struct Scd41 {
    i2c: SharedI2c,
}

impl Scd41 {
    const START_PERIODIC: u16 = 0x21b1;
    const STOP_PERIODIC: u16 = 0x3f86;
    const DATA_READY: u16 = 0xe4b8;
    const READ_MEASUREMENT: u16 = 0xec05;

    fn start(i2c: SharedI2c) -> Result<Self, AgentError> {
        let mut sensor = Self { i2c };
        sensor.reinit()?;
        Ok(sensor)
    }

    fn command(&mut self, command: u16) -> Result<(), AgentError> {
        self.i2c
            .write(SCD41_ADDRESS, &command.to_be_bytes())
            .map_err(|err| AgentError::Sensor(format!("SCD41 command {command:#06x}: {err:?}")))
    }

    fn read_words<const N: usize>(&mut self, command: u16) -> Result<[u16; N], AgentError> {
        self.command(command)?;
        FreeRtos::delay_ms(1);

        let mut raw = vec![0_u8; N * 3];
        self.i2c
            .read(SCD41_ADDRESS, &mut raw)
            .map_err(|err| AgentError::Sensor(format!("SCD41 read {command:#06x}: {err:?}")))?;

        let mut words = [0_u16; N];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(3)) {
            if sensirion_crc(&chunk[..2]) != chunk[2] {
                return Err(AgentError::Sensor(format!("SCD41 CRC mismatch on {command:#06x}")));
            }
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Ok(words)
    }
}

impl Co2Sensor for Scd41 {
    fn data_ready(&mut self) -> Result<bool, AgentError> {
        let [status] = self.read_words::<1>(Self::DATA_READY)?;
        Ok(status & 0x07ff != 0)
    }

    fn read(&mut self) -> Result<(u16, f32, f32), AgentError> {
        let [co2, temperature, humidity] = self.read_words::<3>(Self::READ_MEASUREMENT)?;
        let temperature = -45.0 + 175.0 * f32::from(temperature) / 65535.0;
        let humidity = 100.0 * f32::from(humidity) / 65535.0;
        Ok((co2, temperature, humidity))
    }

    fn reinit(&mut self) -> Result<(), AgentError> {
        // Stop fails harmlessly when no measurement is running.
        let _ = self.command(Self::STOP_PERIODIC);
        FreeRtos::delay_ms(500);
        self.command(Self::START_PERIODIC)?;
        info!("SCD41 periodic measurement started");
        Ok(())
    }
}

fn sensirion_crc(bytes: &[u8]) -> u8 {
    let mut crc = 0xff_u8;
    for byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

struct AdcLight {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AdcLight {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(AdcDriver::new(adc)?, pin, &config)?;
        Ok(Self { channel })
    }
}

impl LightSensor for AdcLight {
    fn read(&mut self) -> Option<u16> {
        match self.channel.read() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("light sensor read failed: {err}");
                None
            }
        }
    }
}

struct OledDisplay {
    oled: Ssd1306<
        I2CInterface<SharedI2c>,
        DisplaySize128x32,
        BufferedGraphicsMode<DisplaySize128x32>,
    >,
}

impl OledDisplay {
    fn new(i2c: SharedI2c) -> anyhow::Result<Self> {
        let mut oled = Ssd1306::new(
            I2CDisplayInterface::new(i2c),
            DisplaySize128x32,
            DisplayRotation::Rotate0,
        )
        .into_buffered_graphics_mode();
        oled.init().map_err(|err| anyhow!("SSD1306 init: {err:?}"))?;
        Ok(Self { oled })
    }
}

impl Display for OledDisplay {
    fn show(&mut self, lines: &[String]) {
        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        self.oled.clear_buffer();
        for (row, line) in lines.iter().take(3).enumerate() {
            let origin = Point::new(0, row as i32 * SSD1306_LINE_HEIGHT);
            let text = Text::with_baseline(line, origin, style, Baseline::Top);
            if let Err(err) = text.draw(&mut self.oled) {
                warn!("OLED draw failed: {err:?}");
            }
        }
        if let Err(err) = self.oled.flush() {
            warn!("OLED flush failed: {err:?}");
        }
    }
}

struct LogDisplay;

impl Display for LogDisplay {
    fn show(&mut self, lines: &[String]) {
        info!("[display] {}", lines.join(" | "));
    }
}

/// Single WS2812 pixel driven from an RMT channel.
struct NeoPixel {
    tx: TxRmtDriver<'static>,
}

impl NeoPixel {
    fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: esp_idf_svc::hal::rmt::RmtChannel,
        P: esp_idf_svc::hal::gpio::OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx =
            TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;
        Ok(Self { tx })
    }

    fn write(&mut self, color: Rgb) -> anyhow::Result<()> {
        let ticks_hz = self.tx.counter_clock()?;
        let pulse = |level: PinState, nanos: u64| {
            Pulse::new_with_duration(ticks_hz, level, &Duration::from_nanos(nanos))
        };
        let zero = (pulse(PinState::High, 350)?, pulse(PinState::Low, 800)?);
        let one = (pulse(PinState::High, 700)?, pulse(PinState::Low, 600)?);

        let grb = (u32::from(color.g) << 16) | (u32::from(color.r) << 8) | u32::from(color.b);
        let mut signal = FixedLengthSignal::<24>::new();
        for bit in 0..24 {
            let set = grb & (1 << (23 - bit)) != 0;
            signal.set(bit, if set { &one } else { &zero })?;
        }
        self.tx.start_blocking(&signal)?;
        Ok(())
    }
}

impl Indicator for NeoPixel {
    fn set_color(&mut self, color: Rgb) {
        if let Err(err) = self.write(color) {
            warn!("failed to drive RGB LED: {err:#}");
        }
    }
}

struct LogIndicator;

impl Indicator for LogIndicator {
    fn set_color(&mut self, color: Rgb) {
        info!("[led] ({}, {}, {})", color.r, color.g, color.b);
    }
}

/// Active-low buttons with pull-ups; a press registers on the falling edge
/// once the line has been stable for the debounce window.
struct PinButtons {
    pins: Vec<PinDriver<'static, AnyIOPin, Input>>,
    stable_low: [bool; 3],
    changed_at: [u64; 3],
    latched: [bool; 3],
}

impl PinButtons {
    fn new(pins: [AnyIOPin; 3]) -> anyhow::Result<Self> {
        let mut drivers = Vec::with_capacity(3);
        for pin in pins {
            let mut driver = PinDriver::input(pin)?;
            driver.set_pull(Pull::Up)?;
            drivers.push(driver);
        }
        Ok(Self {
            pins: drivers,
            stable_low: [false; 3],
            changed_at: [0; 3],
            latched: [false; 3],
        })
    }
}

impl Buttons for PinButtons {
    fn pressed(&mut self, button: Button) -> bool {
        let index = match button {
            Button::A => 0,
            Button::B => 1,
            Button::C => 2,
        };
        let now = monotonic_ms();
        let low = self.pins[index].is_low();

        if low != self.latched[index] {
            self.latched[index] = low;
            self.changed_at[index] = now;
            return false;
        }
        if low == self.stable_low[index]
            || now.saturating_sub(self.changed_at[index]) < BUTTON_DEBOUNCE_MS
        {
            return false;
        }
        self.stable_low[index] = low;
        low
    }
}

struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        feed_watchdog();
        thread::sleep(Duration::from_millis(ms));
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE as esp_idf_svc::sys::esp_err_t {
        // Already initialized by the bootloader config; apply our timeout.
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        return Err(anyhow!("esp_task_wdt_reconfigure failed with code {}", rc));
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK
        || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE as esp_idf_svc::sys::esp_err_t
    {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
