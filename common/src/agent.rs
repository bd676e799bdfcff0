//! The device agent: one owned aggregate holding all runtime state, driven by
//! a single cooperative tick loop.

use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::{
    backend::BackendClient,
    commands::{BroadcastRequest, Command, CommandAction, RawCommand},
    config::{AckOrder, AgentConfig, RuntimeConfig},
    connectivity::ConnectivityManager,
    credentials::Credentials,
    error::{AgentError, ErrorKind},
    hal::{
        BleBroadcaster, Buttons, Clock, Co2Sensor, Display, HttpTransport, Indicator, LightSensor,
        MemoryMonitor, WifiStation,
    },
    radio::RadioArbiter,
    sensor_loop::{PollOutcome, SensorPoller},
    status::{self, StatusLight, StatusScreen},
    telemetry::TelemetryReporter,
    thresholds::{AlertDispatcher, ThresholdSet},
    types::{Button, MetricType, RadioMode, Rgb, SensorReading},
};

/// Platform collaborators the agent is assembled from.
pub struct AgentIo {
    pub clock: Rc<dyn Clock>,
    pub http: Box<dyn HttpTransport>,
    pub memory: Box<dyn MemoryMonitor>,
    pub wifi: Box<dyn WifiStation>,
    pub ble: Box<dyn BleBroadcaster + Send>,
    pub co2: Option<Box<dyn Co2Sensor>>,
    pub light: Option<Box<dyn LightSensor>>,
    pub display: Box<dyn Display>,
    pub indicator: Box<dyn Indicator>,
    pub buttons: Box<dyn Buttons>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandScope {
    All,
    BroadcastOnly,
}

pub struct Agent {
    config: AgentConfig,
    ack_order: AckOrder,
    credentials: Credentials,
    clock: Rc<dyn Clock>,
    connectivity: ConnectivityManager,
    radio: RadioArbiter,
    backend: BackendClient,
    sensors: SensorPoller,
    telemetry: TelemetryReporter,
    thresholds: ThresholdSet,
    alerts: AlertDispatcher,
    screen: StatusScreen,
    light: StatusLight,
    buttons: Box<dyn Buttons>,
    link_up: bool,
    send_failed: bool,
    last_reading: Option<SensorReading>,
    last_breaches: Vec<MetricType>,
    admin_message: Option<String>,
    last_command_check_ms: Option<u64>,
    last_threshold_fetch_ms: Option<u64>,
    threshold_refresh_pending: bool,
}

impl Agent {
    pub fn new(runtime: &RuntimeConfig, credentials: Credentials, io: AgentIo) -> Self {
        let config = runtime.agent.clone();
        let backend = BackendClient::new(
            io.http,
            io.memory,
            io.clock.clone(),
            &credentials,
            &runtime.backend,
            &config,
        );
        info!("backend at {}", backend.base_url());

        Self {
            ack_order: runtime.backend.ack_order,
            connectivity: ConnectivityManager::new(io.wifi, io.clock.clone(), &config),
            radio: RadioArbiter::new(io.ble, config.broadcast_device_name.clone()),
            backend,
            sensors: SensorPoller::new(io.co2, io.light, &config),
            telemetry: TelemetryReporter::new(&config),
            thresholds: ThresholdSet::new(),
            alerts: AlertDispatcher::new(config.alert_cooldown_ms),
            screen: StatusScreen::new(io.display),
            light: StatusLight::new(io.indicator),
            buttons: io.buttons,
            clock: io.clock,
            credentials,
            config,
            link_up: false,
            send_failed: false,
            last_reading: None,
            last_breaches: Vec::new(),
            admin_message: None,
            last_command_check_ms: None,
            last_threshold_fetch_ms: None,
            threshold_refresh_pending: false,
        }
    }

    pub fn mode(&self) -> RadioMode {
        self.radio.mode()
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    pub fn last_breaches(&self) -> &[MetricType] {
        &self.last_breaches
    }

    pub fn admin_message(&self) -> Option<&str> {
        self.admin_message.as_deref()
    }

    pub fn is_linked(&self) -> bool {
        self.link_up
    }

    /// Boot-time work before the first tick: join WiFi and pull thresholds.
    pub fn start(&mut self) {
        self.light.set(Rgb::NORMAL);

        let connected = self.connectivity.connect(&self.credentials);
        let now = self.clock.now_ms();
        self.screen
            .show_status(&status::wifi_screen(connected.as_ref().ok().copied()), now);
        self.link_up = connected.is_ok();
        if self.link_up {
            self.refresh_thresholds(now, true);
        } else {
            warn!("no WiFi; readings will not reach the backend");
        }

        if !self.sensors.is_available() {
            error!("CO2 sensor not initialized");
        }
    }

    pub fn run_forever(&mut self) -> ! {
        loop {
            if let Err(err) = self.tick() {
                self.recover(err);
            }
            self.clock.sleep_ms(self.config.tick_interval_ms);
        }
    }

    /// One pass of the control loop. Within a tick the order is fixed:
    /// buttons, link upkeep, commands, then sensor read, threshold
    /// evaluation, alert dispatch and telemetry.
    pub fn tick(&mut self) -> Result<(), AgentError> {
        let now = self.clock.now_ms();
        self.handle_buttons(now);

        if self.radio.mode() == RadioMode::WifiBackend {
            self.link_up = self.connectivity.ensure_connected(&self.credentials);
        }

        if self.command_check_due(now) {
            self.poll_commands(now);
        }

        if !self.sensors.is_available() {
            self.screen
                .show_status(&status::sensor_error_screen(), self.clock.now_ms());
            self.clock.sleep_ms(self.config.fault_cooldown_ms);
            return Ok(());
        }

        let now = self.clock.now_ms();
        match self.sensors.poll(now)? {
            PollOutcome::Idle => {}
            PollOutcome::NotReady { .. } => {
                self.screen.show_status(&status::waiting_screen(), now);
            }
            PollOutcome::Reading(reading) => self.process_reading(reading, now),
        }
        Ok(())
    }

    /// Catch-all boundary for a failed tick: report, back off, reinitialize.
    pub fn recover(&mut self, err: AgentError) {
        let kind = err.kind();
        warn!("control loop fault ({kind:?}): {err}");

        self.screen
            .show_status(&status::sensor_error_screen(), self.clock.now_ms());
        if kind == ErrorKind::ResourceExhaustion {
            self.backend.reclaim_memory();
        }
        self.clock.sleep_ms(self.config.fault_cooldown_ms);
        self.sensors.force_reinit();
    }

    fn handle_buttons(&mut self, now: u64) {
        for button in Button::ALL {
            if !self.buttons.pressed(button) {
                continue;
            }
            let (lines, duration) = match button {
                Button::A => (
                    status::network_screen(&self.credentials.ssid, self.connectivity.address()),
                    self.config.info_screen_ms,
                ),
                Button::B => (
                    status::thresholds_screen(&self.thresholds),
                    self.config.info_screen_ms,
                ),
                Button::C => (
                    status::admin_screen(self.admin_message.as_deref()),
                    self.config.admin_screen_ms,
                ),
            };
            self.screen.show_override(&lines, now, duration);
        }
    }

    fn command_check_due(&self, now: u64) -> bool {
        self.last_command_check_ms.map_or(true, |last| {
            now.saturating_sub(last) >= self.config.command_check_interval_ms
        })
    }

    fn poll_commands(&mut self, now: u64) {
        self.last_command_check_ms = Some(now);
        match self.radio.mode() {
            RadioMode::WifiBackend => {
                if self.link_up {
                    self.fetch_and_execute(CommandScope::All);
                }
            }
            RadioMode::BleBroadcast => self.borrow_radio_for_commands(),
        }
    }

    /// Broadcast mode round trip: lend the radio to WiFi, poll for broadcast
    /// commands only, then hand the radio back.
    fn borrow_radio_for_commands(&mut self) {
        if let Err(err) = self.radio.open_backend_window() {
            warn!("could not borrow the radio for a command check: {err}");
            return;
        }

        if self.connectivity.ensure_connected(&self.credentials) {
            self.fetch_and_execute(CommandScope::BroadcastOnly);
        } else {
            warn!("WiFi unavailable during broadcast command check");
        }

        let payload = self.telemetry.advertisement(self.last_reading.as_ref());
        if let Err(err) = self.radio.close_backend_window(&payload) {
            warn!("radio window close failed: {err}");
        }
        self.after_mode_change();
    }

    fn fetch_and_execute(&mut self, scope: CommandScope) {
        let commands: Vec<RawCommand> = {
            let Some(permit) = self.radio.backend_permit() else {
                return;
            };
            match self.backend.fetch_commands(&permit) {
                Ok(commands) => commands,
                Err(err) => {
                    warn!("command fetch failed ({:?}): {err}", err.kind());
                    return;
                }
            }
        };

        for raw in commands {
            // Nothing left in the batch can be acknowledged once the radio
            // belongs to BLE; the backend redelivers it later.
            if scope == CommandScope::All && self.radio.mode() == RadioMode::BleBroadcast {
                debug!("broadcast mode entered; deferring the rest of the batch");
                break;
            }
            if scope == CommandScope::BroadcastOnly && !raw.is_broadcast() {
                debug!(
                    "skipping {:?} while broadcasting",
                    raw.command_type.as_deref().unwrap_or("?")
                );
                continue;
            }
            match raw.decode() {
                Ok(command) => self.run_command(command),
                Err(err) => {
                    warn!("ignoring undecodable command: {err}");
                    if let Some(id) = raw.id_string() {
                        self.acknowledge(&id);
                    }
                }
            }
        }
    }

    /// Executes and acknowledges one command. A radio switch issued outside a
    /// backend window is acknowledged first, since afterwards the radio
    /// belongs to BLE.
    fn run_command(&mut self, command: Command) {
        info!("executing {:?}", command.action);
        let ack_first = self.ack_order == AckOrder::BeforeExecute
            || (command.action.is_broadcast() && !self.radio.in_backend_window());

        if ack_first {
            if let Some(id) = command.id.as_deref() {
                self.acknowledge(id);
            }
        }
        self.execute(command.action);
        if !ack_first {
            if let Some(id) = command.id.as_deref() {
                self.acknowledge(id);
            }
        }
    }

    fn acknowledge(&mut self, id: &str) {
        let Some(permit) = self.radio.backend_permit() else {
            warn!("radio busy; acknowledgment for command {id} dropped");
            return;
        };
        self.backend.acknowledge(&permit, id);
    }

    fn execute(&mut self, action: CommandAction) {
        match action {
            CommandAction::SetLedColor(color) => {
                let rest = self.idle_color();
                self.light.flash(
                    color,
                    self.config.led_flash_count,
                    self.config.led_flash_delay_ms,
                    rest,
                    self.clock.as_ref(),
                );
            }
            CommandAction::DisplayMessage(message) => {
                let now = self.clock.now_ms();
                self.screen.show_override(
                    &status::admin_screen(Some(&message)),
                    now,
                    self.config.admin_screen_ms,
                );
                self.admin_message = Some(message);
            }
            CommandAction::RefreshConfig => {
                self.threshold_refresh_pending = true;
                self.refresh_thresholds(self.clock.now_ms(), true);
            }
            CommandAction::BleBroadcast(request) => self.apply_broadcast(request),
        }
    }

    fn apply_broadcast(&mut self, request: BroadcastRequest) {
        let payload = self.telemetry.advertisement(self.last_reading.as_ref());
        let result = match request {
            BroadcastRequest::Start => self.radio.request_broadcast(&payload),
            BroadcastRequest::Stop => self.radio.request_backend(),
            BroadcastRequest::Toggle => self.radio.toggle(&payload),
        };
        if let Err(err) = result {
            warn!("broadcast {request:?} failed: {err}");
        }
        self.after_mode_change();
    }

    fn after_mode_change(&mut self) {
        if self.radio.is_advertising() {
            self.telemetry
                .note_broadcast(self.last_reading.as_ref(), self.clock.now_ms());
        }
        let color = self.idle_color();
        self.light.set(color);
    }

    fn idle_color(&self) -> Rgb {
        if !self.last_breaches.is_empty() {
            Rgb::ALERT
        } else if self.radio.mode() == RadioMode::BleBroadcast {
            Rgb::BROADCAST
        } else {
            Rgb::NORMAL
        }
    }

    fn refresh_thresholds(&mut self, now: u64, force: bool) {
        let due = self.last_threshold_fetch_ms.map_or(true, |last| {
            now.saturating_sub(last) >= self.config.threshold_refresh_interval_ms
        });
        if !(force || due || self.threshold_refresh_pending) {
            return;
        }
        if !self.link_up {
            return;
        }
        let Some(permit) = self.radio.backend_permit() else {
            return;
        };

        match self.backend.fetch_thresholds(&permit) {
            Ok(fetched) => {
                if fetched != self.thresholds {
                    info!("threshold change detected: {fetched}");
                    self.thresholds = fetched;
                }
                self.last_threshold_fetch_ms = Some(now);
                self.threshold_refresh_pending = false;
            }
            Err(err) => warn!("threshold fetch failed ({:?}): {err}", err.kind()),
        }
    }

    fn process_reading(&mut self, reading: SensorReading, now: u64) {
        if self.radio.mode() == RadioMode::WifiBackend {
            self.refresh_thresholds(now, false);
        }

        let breaches = self.thresholds.evaluate(&reading);
        let breach_names: Vec<&str> = breaches.iter().map(|metric| metric.as_str()).collect();
        info!(
            "CO2: {} ppm | Temp: {:.1}C | Hum: {:.1}% | Light: {:?} | Breach: [{}]",
            reading.co2_ppm,
            reading.temperature_c,
            reading.humidity_pct,
            reading.light,
            breach_names.join(",")
        );

        self.last_reading = Some(reading);
        self.last_breaches = breaches.clone();
        let color = self.idle_color();
        self.light.set(color);

        self.dispatch_alerts(&breaches, &reading, now);
        self.report(&reading, now);

        self.screen.show_status(
            &status::reading_screen(&reading, &breaches, self.send_failed),
            self.clock.now_ms(),
        );
    }

    fn dispatch_alerts(&mut self, breaches: &[MetricType], reading: &SensorReading, now: u64) {
        if breaches.is_empty() || !self.link_up || self.radio.mode() != RadioMode::WifiBackend {
            return;
        }
        let Some(permit) = self.radio.backend_permit() else {
            return;
        };
        let mut sink = self.backend.alert_sink(&permit);
        self.alerts.dispatch(breaches, reading, now, &mut sink);
    }

    fn report(&mut self, reading: &SensorReading, now: u64) {
        match self.radio.mode() {
            RadioMode::WifiBackend => {
                if !self.link_up || !self.telemetry.post_due(now) {
                    return;
                }
                let Some(permit) = self.radio.backend_permit() else {
                    return;
                };
                self.telemetry.mark_posted(now);
                match self.backend.post_sensor_data(&permit, reading) {
                    Ok(id) => {
                        debug!("reading accepted as {id:?}");
                        self.send_failed = false;
                    }
                    Err(err) => {
                        warn!("sensor data post failed ({:?}): {err}", err.kind());
                        self.send_failed = true;
                    }
                }
            }
            RadioMode::BleBroadcast => {
                let Some(payload) = self.telemetry.broadcast_update(reading, now) else {
                    return;
                };
                match self.radio.update_advertisement(&payload) {
                    Ok(()) => self.telemetry.note_broadcast(Some(reading), now),
                    Err(err) => warn!("advertisement update failed: {err}"),
                }
            }
        }
    }
}
