//! Pump relay and grow-light PWM.  The `gpio` feature gates the real rppal
//! driver; without it, a mock board logs state changes.

use anyhow::Result;

use crate::config::{LightConfig, PumpConfig};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Native PWM range of the grow-light output.
pub const LIGHT_LEVEL_MAX: u8 = 255;

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ActuatorBoard {
    pump: OutputPin,
    pump_active_low: bool,
    pump_on: bool,
    light: OutputPin,
    pwm_frequency_hz: f64,
    light_level: u8,
}

#[cfg(feature = "gpio")]
impl ActuatorBoard {
    pub fn new(pump: &PumpConfig, lights: &LightConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        let pump_pin = gpio.get(pump.gpio_pin)?.into_output();
        let light_pin = gpio.get(lights.gpio_pin)?.into_output();

        let mut board = Self {
            pump: pump_pin,
            pump_active_low: pump.active_low,
            pump_on: false,
            light: light_pin,
            pwm_frequency_hz: lights.pwm_frequency_hz,
            light_level: 0,
        };
        // Fail-safe: everything OFF at startup.
        board.all_off();

        tracing::info!(
            pump_gpio = pump.gpio_pin,
            light_gpio = lights.gpio_pin,
            pump_active_low = pump.active_low,
            "actuator board initialised"
        );
        Ok(board)
    }

    pub fn set_pump(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.pump_active_low {
            self.pump.set_high();
        } else {
            self.pump.set_low();
        }
        self.pump_on = on;
        tracing::info!(pump = if on { "ON" } else { "OFF" }, "pump set");
    }

    pub fn set_light_level(&mut self, level: u8) {
        let duty = level as f64 / LIGHT_LEVEL_MAX as f64;
        let result = if level == 0 {
            self.light.clear_pwm().map(|_| self.light.set_low())
        } else {
            self.light.set_pwm_frequency(self.pwm_frequency_hz, duty)
        };
        match result {
            Ok(()) => {
                self.light_level = level;
                tracing::info!(level, "light level set");
            }
            Err(e) => tracing::error!(level, "light pwm failed: {e}"),
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn light_level(&self) -> u8 {
        self.light_level
    }

    pub fn all_off(&mut self) {
        self.set_pump(false);
        self.set_light_level(0);
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ActuatorBoard {
    pub(crate) pump_on: bool,
    pub(crate) light_level: u8,
    /// Every change in order, for assertions on command batches.
    pub(crate) history: Vec<ActuatorChange>,
}

#[cfg(not(feature = "gpio"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActuatorChange {
    Pump(bool),
    Light(u8),
}

#[cfg(not(feature = "gpio"))]
impl ActuatorBoard {
    pub fn new(pump: &PumpConfig, lights: &LightConfig) -> Result<Self> {
        tracing::info!(
            pump_gpio = pump.gpio_pin,
            light_gpio = lights.gpio_pin,
            "[mock-gpio] actuator board initialised (no hardware)"
        );
        Ok(Self {
            pump_on: false,
            light_level: 0,
            history: Vec::new(),
        })
    }

    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
        self.history.push(ActuatorChange::Pump(on));
        tracing::info!(pump = if on { "ON" } else { "OFF" }, "[mock-gpio] pump set");
    }

    pub fn set_light_level(&mut self, level: u8) {
        self.light_level = level;
        self.history.push(ActuatorChange::Light(level));
        tracing::info!(level, "[mock-gpio] light level set");
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn light_level(&self) -> u8 {
        self.light_level
    }

    pub fn all_off(&mut self) {
        self.set_pump(false);
        self.set_light_level(0);
    }
}

/// Clamp a brightness percentage to `[0, 100]` and scale to the native PWM
/// range.
pub fn brightness_to_level(brightness: f64) -> u8 {
    let pct = if brightness.is_nan() {
        0.0
    } else {
        brightness.clamp(0.0, 100.0)
    };
    (pct * LIGHT_LEVEL_MAX as f64 / 100.0).round() as u8
}

// ===========================================================================
// Tests
// ===========================================================================
