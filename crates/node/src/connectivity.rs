//! Wireless association state and bounded reconnection.
//!
//! Association failure is never fatal: callers get `false` back and every
//! network-dependent duty no-ops until the link returns.

use std::fmt;
use std::net::UdpSocket;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::NetworkConfig;

/// Any routable address; connecting a UDP socket sends nothing but makes
/// the kernel pick the outbound interface address.
const ROUTE_PROBE_ADDR: &str = "198.51.100.1:9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// The wireless stack underneath the manager.
#[allow(async_fn_in_trait)]
pub trait Link {
    /// Kick off association.  Returns once the request is issued; progress
    /// is observed through [`Link::is_associated`].
    async fn begin(&mut self, ssid: &str, password: &str) -> Result<()>;

    fn is_associated(&self) -> bool;

    fn local_addr(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectivityManager<L> {
    link: L,
    ssid: String,
    password: String,
    max_attempts: u32,
    retry_delay: Duration,
    state: ConnectionState,
    address: Option<String>,
}

impl<L: Link> ConnectivityManager<L> {
    pub fn new(link: L, cfg: &NetworkConfig) -> Self {
        Self {
            link,
            ssid: cfg.ssid.clone(),
            password: cfg.password.clone(),
            max_attempts: cfg.max_attempts,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            state: ConnectionState::Disconnected,
            address: None,
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.state
    }

    /// Address recorded on the last successful association.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    #[cfg(test)]
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Associate if not already connected, polling up to `max_attempts`
    /// times with `retry_delay` between polls.
    pub async fn ensure_connected(&mut self) -> bool {
        if self.state == ConnectionState::Connected && self.link.is_associated() {
            return true;
        }

        self.state = ConnectionState::Connecting;
        tracing::info!(ssid = %self.ssid, "connecting to wifi");

        if let Err(e) = self.link.begin(&self.ssid, &self.password).await {
            tracing::error!("wifi association request failed: {e:#}");
            self.state = ConnectionState::Disconnected;
            return false;
        }

        for attempt in 1..=self.max_attempts {
            if self.link.is_associated() {
                self.mark_connected(attempt);
                return true;
            }
            tokio::time::sleep(self.retry_delay).await;
        }
        if self.link.is_associated() {
            self.mark_connected(self.max_attempts);
            return true;
        }

        self.state = ConnectionState::Disconnected;
        self.address = None;
        tracing::warn!(
            attempts = self.max_attempts,
            "wifi connection failed, continuing offline"
        );
        false
    }

    /// Cheap per-iteration inspection.  Only reconnects when the link has
    /// actually dropped.
    pub async fn refresh(&mut self) -> ConnectionState {
        if self.link.is_associated() {
            if self.state != ConnectionState::Connected {
                self.mark_connected(0);
            }
            return self.state;
        }

        if self.state == ConnectionState::Connected {
            tracing::warn!("wifi link lost");
            self.state = ConnectionState::Disconnected;
        }
        self.ensure_connected().await;
        self.state
    }

    fn mark_connected(&mut self, attempt: u32) {
        self.state = ConnectionState::Connected;
        self.address = self.link.local_addr();
        tracing::info!(
            attempt,
            address = self.address.as_deref().unwrap_or("unknown"),
            "wifi connected"
        );
    }
}

// ---------------------------------------------------------------------------
// Linux interface link
// ---------------------------------------------------------------------------

/// Observes a kernel-managed interface.  Association itself belongs to the
/// OS supplicant; `begin` only checks the interface exists.
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
pub struct SysfsLink {
    interface: String,
}

#[cfg_attr(not(feature = "adc"), allow(dead_code))]
impl SysfsLink {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    fn operstate_path(&self) -> String {
        format!("/sys/class/net/{}/operstate", self.interface)
    }
}

impl Link for SysfsLink {
    async fn begin(&mut self, ssid: &str, _password: &str) -> Result<()> {
        let path = self.operstate_path();
        tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("interface {} not present ({path})", self.interface))?;
        tracing::debug!(iface = %self.interface, ssid, "waiting for supplicant association");
        Ok(())
    }

    fn is_associated(&self) -> bool {
        std::fs::read_to_string(self.operstate_path())
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }

    fn local_addr(&self) -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(ROUTE_PROBE_ADDR).ok()?;
        socket.local_addr().ok().map(|a| a.ip().to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
