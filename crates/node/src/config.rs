//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub lights: LightConfig,
    #[serde(default)]
    pub adc: AdcConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    pub interface: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            interface: "wlan0".into(),
            max_attempts: 20,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub device_key: String,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
}

fn default_request_timeout_sec() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Overrides the MAC read from the network interface.
    pub mac_address: Option<String>,
    pub calibration_db: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac_address: None,
            calibration_db: "sqlite:calibration.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sensor_interval_sec: u64,
    pub command_interval_sec: u64,
    pub idle_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sensor_interval_sec: 30,
            command_interval_sec: 10,
            idle_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub default_duration_sec: u64,
    pub max_duration_sec: u64,
    pub active_low: bool,
    pub gpio_pin: u8,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            default_duration_sec: 30,
            max_duration_sec: 300,
            active_low: false,
            gpio_pin: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub gpio_pin: u8,
    pub pwm_frequency_hz: f64,
    pub default_on_brightness: u8,
    pub default_set_brightness: u8,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 18,
            pwm_frequency_hz: 1000.0,
            default_on_brightness: 80,
            default_set_brightness: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub i2c_address: u16,
    pub soil_channel: usize,
    pub light_channel: usize,
    pub battery_channel: usize,
    /// Raw count corresponding to `reference_volts` at the ADC input.
    pub full_scale: u32,
    pub reference_volts: f32,
    /// Battery voltage divider ratio (battery volts per input volt).
    pub divider_ratio: f32,
    pub sht4x_address: u16,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            i2c_address: 0x48,
            soil_channel: 0,
            light_channel: 1,
            battery_channel: 2,
            full_scale: 1024,
            reference_volts: 3.3,
            divider_ratio: 2.0,
            sht4x_address: 0x44,
        }
    }
}

/// Highest ADS1115 single-ended channel index.
const MAX_ADC_CHANNEL: usize = 3;

/// BCM pins usable on the 40-pin header.  GPIO 0-1 are reserved for the ID
/// EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_sec)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_secs(self.timing.sensor_interval_sec)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_secs(self.timing.command_interval_sec)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.timing.idle_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section.  Returns an error listing every violation
    /// found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_server(&mut errors);
        self.validate_network(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_actuators(&mut errors);
        self.validate_adc(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_server(&self, errors: &mut Vec<String>) {
        let url = self.server.base_url.trim();
        if url.is_empty() {
            errors.push("server.base_url is empty".into());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "server.base_url '{url}' must start with http:// or https://"
            ));
        }

        if self.server.device_key.trim().is_empty() {
            errors.push("server.device_key is empty".into());
        }

        if !(1..=120).contains(&self.server.request_timeout_sec) {
            errors.push(format!(
                "server.request_timeout_sec {} out of range [1, 120]",
                self.server.request_timeout_sec
            ));
        }
    }

    fn validate_network(&self, errors: &mut Vec<String>) {
        if self.network.interface.trim().is_empty() {
            errors.push("network.interface is empty".into());
        }
        if self.network.max_attempts == 0 {
            errors.push("network.max_attempts must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        if t.sensor_interval_sec == 0 {
            errors.push("timing.sensor_interval_sec must be positive".into());
        }
        if t.command_interval_sec == 0 {
            errors.push("timing.command_interval_sec must be positive".into());
        }
        if t.idle_delay_ms == 0 {
            errors.push("timing.idle_delay_ms must be positive".into());
        }
    }

    fn validate_actuators(&self, errors: &mut Vec<String>) {
        let p = &self.pump;
        if p.max_duration_sec == 0 {
            errors.push("pump.max_duration_sec must be positive".into());
        }
        if p.default_duration_sec == 0 {
            errors.push("pump.default_duration_sec must be positive".into());
        } else if p.default_duration_sec > p.max_duration_sec {
            errors.push(format!(
                "pump.default_duration_sec ({}) exceeds pump.max_duration_sec ({})",
                p.default_duration_sec, p.max_duration_sec
            ));
        }

        let l = &self.lights;
        if l.default_on_brightness > 100 {
            errors.push(format!(
                "lights.default_on_brightness {} out of range [0, 100]",
                l.default_on_brightness
            ));
        }
        if l.default_set_brightness > 100 {
            errors.push(format!(
                "lights.default_set_brightness {} out of range [0, 100]",
                l.default_set_brightness
            ));
        }
        if l.pwm_frequency_hz.is_nan() || l.pwm_frequency_hz <= 0.0 {
            errors.push(format!(
                "lights.pwm_frequency_hz must be positive, got {}",
                l.pwm_frequency_hz
            ));
        }

        for (name, pin) in [("pump.gpio_pin", p.gpio_pin), ("lights.gpio_pin", l.gpio_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if p.gpio_pin == l.gpio_pin {
            errors.push(format!(
                "pump.gpio_pin and lights.gpio_pin are both {}",
                p.gpio_pin
            ));
        }
    }

    fn validate_adc(&self, errors: &mut Vec<String>) {
        let a = &self.adc;
        let channels = [
            ("adc.soil_channel", a.soil_channel),
            ("adc.light_channel", a.light_channel),
            ("adc.battery_channel", a.battery_channel),
        ];
        for (name, ch) in channels {
            if ch > MAX_ADC_CHANNEL {
                errors.push(format!("{name} {ch} exceeds maximum ({MAX_ADC_CHANNEL})"));
            }
        }
        if a.soil_channel == a.light_channel
            || a.soil_channel == a.battery_channel
            || a.light_channel == a.battery_channel
        {
            errors.push("adc channels must be distinct".into());
        }
        if a.full_scale == 0 {
            errors.push("adc.full_scale must be positive".into());
        }
        if a.reference_volts.is_nan() || a.reference_volts <= 0.0 {
            errors.push(format!(
                "adc.reference_volts must be positive, got {}",
                a.reference_volts
            ));
        }
        if a.divider_ratio.is_nan() || a.divider_ratio <= 0.0 {
            errors.push(format!(
                "adc.divider_ratio must be positive, got {}",
                a.divider_ratio
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML document, apply environment overrides, and validate.
pub fn parse(contents: &str, origin: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(contents).with_context(|| format!("failed to parse config: {origin}"))?;
    apply_env_overrides(&mut config, |k| env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {origin}"))?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents, path)
}

/// Secrets and endpoints may come from the environment instead of the file.
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_URL") {
        config.server.base_url = v;
    }
    if let Some(v) = lookup("DEVICE_KEY") {
        config.server.device_key = v;
    }
    if let Some(v) = lookup("WIFI_SSID") {
        config.network.ssid = v;
    }
    if let Some(v) = lookup("WIFI_PASSWORD") {
        config.network.password = v;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
