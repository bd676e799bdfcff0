use std::{net::Ipv4Addr, rc::Rc};

use tracing::{info, warn};

use crate::{
    config::AgentConfig, credentials::Credentials, error::AgentError, hal::Clock,
    hal::WifiStation,
};

const LINK_POLL_MS: u64 = 1_000;

pub struct ConnectivityManager {
    wifi: Box<dyn WifiStation>,
    clock: Rc<dyn Clock>,
    connect_ticks: u32,
    settle_ms: u64,
    address: Option<Ipv4Addr>,
}

impl ConnectivityManager {
    pub fn new(wifi: Box<dyn WifiStation>, clock: Rc<dyn Clock>, config: &AgentConfig) -> Self {
        Self {
            wifi,
            clock,
            connect_ticks: config.wifi_connect_ticks,
            settle_ms: config.wifi_settle_ms,
            address: None,
        }
    }

    /// Cycles the station interface and joins the stored network, polling for
    /// link-up once per second up to the configured budget.
    pub fn connect(&mut self, credentials: &Credentials) -> Result<Ipv4Addr, AgentError> {
        self.address = None;

        self.wifi.set_active(false)?;
        self.clock.sleep_ms(self.settle_ms);
        self.wifi.set_active(true)?;

        info!("connecting to WiFi `{}`", credentials.ssid);
        self.wifi.connect(&credentials.ssid, &credentials.password)?;

        for _ in 0..self.connect_ticks {
            if self.wifi.is_connected() {
                break;
            }
            self.clock.sleep_ms(LINK_POLL_MS);
        }

        if !self.wifi.is_connected() {
            warn!(
                "WiFi `{}` did not come up within {} s",
                credentials.ssid, self.connect_ticks
            );
            return Err(AgentError::LinkDown);
        }

        let address = self.wifi.address().unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.address = Some(address);
        info!("WiFi connected, address {address}");
        Ok(address)
    }

    /// No-op while linked (the cached address is refreshed); otherwise runs a
    /// full [`connect`](Self::connect). Returns whether the link is up.
    pub fn ensure_connected(&mut self, credentials: &Credentials) -> bool {
        if self.wifi.is_connected() {
            self.address = self.wifi.address();
            return true;
        }

        warn!("WiFi link lost, reconnecting");
        match self.connect(credentials) {
            Ok(_) => true,
            Err(err) => {
                warn!("WiFi reconnect failed: {err}");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeClock, FakeWifi};

    fn credentials() -> Credentials {
        Credentials {
            ssid: "home".into(),
            password: "pw".into(),
            backend_host: "10.0.0.5".into(),
            device_key: "k".into(),
        }
    }

    fn manager(wifi: &FakeWifi, clock: &FakeClock) -> ConnectivityManager {
        ConnectivityManager::new(
            Box::new(wifi.clone()),
            Rc::new(clock.clone()),
            &AgentConfig::default(),
        )
    }

    #[test]
    fn connect_cycles_interface_before_joining() {
        let wifi = FakeWifi::after_polls(3);
        let clock = FakeClock::new();
        let mut connectivity = manager(&wifi, &clock);

        let address = connectivity.connect(&credentials()).unwrap();

        assert_eq!(address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(wifi.state.borrow().activations, vec![false, true]);
        assert_eq!(clock.now_ms(), 500 + 3 * LINK_POLL_MS);
        assert_eq!(connectivity.address(), Some(address));
    }

    #[test]
    fn connect_gives_up_after_tick_budget() {
        let wifi = FakeWifi::unreachable();
        let clock = FakeClock::new();
        let mut connectivity = manager(&wifi, &clock);

        let result = connectivity.connect(&credentials());

        assert!(matches!(result, Err(AgentError::LinkDown)));
        assert_eq!(clock.now_ms(), 500 + 20 * LINK_POLL_MS);
        assert_eq!(connectivity.address(), None);
    }

    #[test]
    fn ensure_connected_is_idempotent_while_linked() {
        let wifi = FakeWifi::reachable();
        let clock = FakeClock::new();
        let mut connectivity = manager(&wifi, &clock);
        connectivity.connect(&credentials()).unwrap();
        let elapsed = clock.now_ms();

        assert!(connectivity.ensure_connected(&credentials()));
        assert!(connectivity.ensure_connected(&credentials()));

        assert_eq!(wifi.state.borrow().connect_calls, 1);
        assert_eq!(clock.now_ms(), elapsed);
    }

    #[test]
    fn ensure_connected_reconnects_after_link_loss() {
        let wifi = FakeWifi::reachable();
        let clock = FakeClock::new();
        let mut connectivity = manager(&wifi, &clock);
        connectivity.connect(&credentials()).unwrap();

        wifi.drop_link();

        assert!(connectivity.ensure_connected(&credentials()));
        assert_eq!(wifi.state.borrow().connect_calls, 2);
    }
}
