//! Stateful transducer simulator for running the agent without hardware.
//!
//! Models:
//! - Soil moisture random walk with mean reversion and drying drift
//! - Closed-loop watering response (moisture rises while the pump runs)
//! - Diurnal light level and temperature swing
//! - Slow battery discharge
//! - Occasional climate sensor dropouts (NaN), as a flaky DHT-style part does

use std::cell::Cell;
use std::fmt;

use crate::connectivity::Link;
use crate::sensor::{RawSample, Transducers};

/// ADC counts on the simulated 10-bit inputs.
const ADC_MAX: f64 = 1023.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range soil drifting dry, moderate noise, rare dropouts.
    Drying,
    /// Hovers near the centre, low noise, no dropouts.
    Stable,
    /// High noise and ~15% climate dropouts.  Exercises invalid-reading
    /// suppression.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct GardenSim {
    /// Current "true" soil moisture in ADC counts (higher = wetter).
    soil: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    battery_volts: f64,
    temperature_base: f64,
    humidity_base: f64,

    dropout_prob: f32,
    diurnal_period_s: f64,

    watering: bool,
    wet_rate: f64,
}

impl GardenSim {
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600 for
    /// fast iteration or 86400 for real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, dropout_prob, start) = match scenario {
            Scenario::Drying => (-2.0, 8.0, 0.02, 6.0, 0.02_f32, 0.5),
            Scenario::Stable => (-0.2, 3.0, 0.05, 2.0, 0.0, 0.5),
            Scenario::Flaky => (-1.0, 15.0, 0.02, 20.0, 0.15, 0.5),
        };

        Self {
            soil: ADC_MAX * start,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: ADC_MAX * 0.5,
            noise_sigma,
            battery_volts: 4.1,
            temperature_base: 22.0,
            humidity_base: 55.0,
            dropout_prob,
            diurnal_period_s,
            watering: false,
            wet_rate: 25.0,
        }
    }

    fn diurnal_phase(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s
    }

    fn next_soil(&mut self) -> i32 {
        let pull = self.mean_reversion * (self.center - self.soil);
        let wet = if self.watering { self.wet_rate } else { 0.0 };
        self.soil = (self.soil
            + self.drift_per_sample
            + pull
            + gaussian(0.0, self.walk_sigma)
            + wet)
            .clamp(0.0, ADC_MAX);

        let reading = self.soil + gaussian(0.0, self.noise_sigma);
        reading.round().clamp(0.0, ADC_MAX) as i32
    }

    fn next_light(&self, phase: f64) -> i32 {
        let daylight = phase.sin().max(0.0);
        let reading = ADC_MAX * daylight + gaussian(0.0, self.noise_sigma);
        reading.round().clamp(0.0, ADC_MAX) as i32
    }

    fn next_battery(&mut self) -> i32 {
        self.battery_volts = (self.battery_volts - 0.0005).max(3.0);
        // 2:1 divider into a 3.3 V reference.
        let pin_volts = self.battery_volts / 2.0;
        (pin_volts / 3.3 * 1024.0).round().clamp(0.0, ADC_MAX) as i32
    }

    fn next_climate(&self, phase: f64) -> (f32, f32) {
        if fastrand::f32() < self.dropout_prob {
            return (f32::NAN, f32::NAN);
        }
        let t = self.temperature_base + 4.0 * phase.sin() + gaussian(0.0, 0.2);
        let h = (self.humidity_base - 8.0 * phase.sin() + gaussian(0.0, 0.8)).clamp(0.0, 100.0);
        (t as f32, h as f32)
    }
}

impl Transducers for GardenSim {
    fn read(&mut self) -> RawSample {
        let phase = self.diurnal_phase();
        let (temperature_c, humidity_pct) = self.next_climate(phase);
        RawSample {
            soil: self.next_soil(),
            light: self.next_light(phase),
            battery: self.next_battery(),
            temperature_c,
            humidity_pct,
        }
    }

    fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }
}

// ---------------------------------------------------------------------------
// Simulated wifi link
// ---------------------------------------------------------------------------

/// Associates on the first poll after `begin` and drops with a fixed
/// per-poll probability.
pub struct SimLink {
    up: Cell<bool>,
    started: bool,
    drop_prob: f32,
}

impl SimLink {
    pub fn new(scenario: Scenario) -> Self {
        let drop_prob = match scenario {
            Scenario::Flaky => 0.01,
            Scenario::Drying | Scenario::Stable => 0.0,
        };
        Self {
            up: Cell::new(false),
            started: false,
            drop_prob,
        }
    }
}

impl Link for SimLink {
    async fn begin(&mut self, ssid: &str, _password: &str) -> anyhow::Result<()> {
        tracing::info!(ssid, "[sim] associating");
        self.started = true;
        Ok(())
    }

    fn is_associated(&self) -> bool {
        if !self.started {
            return false;
        }
        if self.up.get() && fastrand::f32() < self.drop_prob {
            self.up.set(false);
            return false;
        }
        self.up.set(true);
        true
    }

    fn local_addr(&self) -> Option<String> {
        self.up.get().then(|| "192.168.4.23".to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
