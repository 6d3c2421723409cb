use anyhow::{bail, Context, Result};

use crate::config::Config;

/// Who this device is and where it reports.  Built once at boot and never
/// rotated within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Upper-case hex, no separators (e.g. `"A4CF12B3C0DE"`).
    pub mac_address: String,
    pub device_key: String,
    /// Base URL without a trailing slash.
    pub server_base_url: String,
}

impl DeviceIdentity {
    pub fn new(mac: &str, device_key: &str, server_base_url: &str) -> Result<Self> {
        Ok(Self {
            mac_address: normalize_mac(mac)?,
            device_key: device_key.to_string(),
            server_base_url: server_base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    /// Use the configured MAC if present, otherwise read it from the
    /// network interface.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mac = match &cfg.device.mac_address {
            Some(mac) => mac.clone(),
            None => read_interface_mac(&cfg.network.interface)?,
        };
        Self::new(&mac, &cfg.server.device_key, &cfg.server.base_url)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_base_url)
    }

    pub fn hostname(&self) -> String {
        format!("SmartGarden-{}", self.mac_address)
    }
}

fn read_interface_mac(iface: &str) -> Result<String> {
    let path = format!("/sys/class/net/{iface}/address");
    std::fs::read_to_string(&path).with_context(|| format!("failed to read MAC from {path}"))
}

/// Strip `:`/`-` separators and upper-case.  Rejects anything that is not
/// 12 hex digits.
pub fn normalize_mac(raw: &str) -> Result<String> {
    let mac: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid MAC address {raw:?}");
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_colons_and_uppercases() {
        assert_eq!(normalize_mac("a4:cf:12:b3:c0:de\n").unwrap(), "A4CF12B3C0DE");
    }

    #[test]
    fn normalize_accepts_dashes_and_bare() {
        assert_eq!(normalize_mac("A4-CF-12-B3-C0-DE").unwrap(), "A4CF12B3C0DE");
        assert_eq!(normalize_mac("a4cf12b3c0de").unwrap(), "A4CF12B3C0DE");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_mac("").is_err());
        assert!(normalize_mac("a4:cf:12").is_err());
        assert!(normalize_mac("zz:cf:12:b3:c0:de").is_err());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let id = DeviceIdentity::new("a4cf12b3c0de", "k", "https://x.example/api/").unwrap();
        assert_eq!(id.url("/sensors/data"), "https://x.example/api/sensors/data");
    }

    #[test]
    fn hostname_uses_mac() {
        let id = DeviceIdentity::new("a4cf12b3c0de", "k", "http://x").unwrap();
        assert_eq!(id.hostname(), "SmartGarden-A4CF12B3C0DE");
    }
}
