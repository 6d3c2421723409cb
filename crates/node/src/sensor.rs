//! Sampling raw transducer inputs into a calibrated [`Reading`].

use serde::Serialize;

use crate::calibration::{map_to_percent, Calibration};
use crate::config::AdcConfig;

/// Battery window mapped onto 0-100 %.
const BATTERY_EMPTY_VOLTS: f32 = 3.2;
const BATTERY_FULL_VOLTS: f32 = 4.2;

/// One pass over every transducer, before calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub soil: i32,
    pub light: i32,
    pub battery: i32,
    /// NaN when the climate sensor failed to decode.
    pub temperature_c: f32,
    /// NaN when the climate sensor failed to decode.
    pub humidity_pct: f32,
}

/// Source of raw samples: ADC hardware or the simulator.
pub trait Transducers {
    fn read(&mut self) -> RawSample;

    /// Pump feedback for implementations that model it.
    fn set_watering(&mut self, _active: bool) {}
}

/// Immutable snapshot of every sensor.  `valid` is false when temperature or
/// humidity is NaN; invalid readings are never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub soil_moisture_pct: f32,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light_pct: f32,
    pub battery_pct: f32,
    pub captured_at_ms: u64,
    pub valid: bool,
}

/// Converts battery ADC counts to volts through the divider.
#[derive(Debug, Clone, Copy)]
pub struct BatteryDivider {
    pub full_scale: u32,
    pub reference_volts: f32,
    pub divider_ratio: f32,
}

impl From<&AdcConfig> for BatteryDivider {
    fn from(cfg: &AdcConfig) -> Self {
        Self {
            full_scale: cfg.full_scale,
            reference_volts: cfg.reference_volts,
            divider_ratio: cfg.divider_ratio,
        }
    }
}

impl Default for BatteryDivider {
    fn default() -> Self {
        Self::from(&AdcConfig::default())
    }
}

impl BatteryDivider {
    pub fn volts(&self, raw: i32) -> f32 {
        raw as f32 / self.full_scale as f32 * self.reference_volts * self.divider_ratio
    }

    pub fn percent(&self, raw: i32) -> f32 {
        let v = self.volts(raw);
        let pct = (v - BATTERY_EMPTY_VOLTS) * 100.0 / (BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS);
        pct.clamp(0.0, 100.0)
    }
}

pub struct SensorReader<T> {
    transducers: T,
    battery: BatteryDivider,
}

impl<T: Transducers> SensorReader<T> {
    pub fn new(transducers: T, battery: BatteryDivider) -> Self {
        Self {
            transducers,
            battery,
        }
    }

    /// Read every transducer once and apply `cal`.
    pub fn sample(&mut self, cal: &Calibration, captured_at_ms: u64) -> Reading {
        let raw = self.transducers.read();
        let reading = calibrate(&raw, cal, &self.battery, captured_at_ms);

        tracing::debug!(
            soil_raw = raw.soil,
            light_raw = raw.light,
            battery_raw = raw.battery,
            "raw sample"
        );
        if reading.valid {
            tracing::info!(
                soil = reading.soil_moisture_pct,
                temperature = reading.temperature_c,
                humidity = reading.humidity_pct,
                light = reading.light_pct,
                battery = reading.battery_pct,
                "sensors read"
            );
        } else {
            tracing::warn!(
                temperature = raw.temperature_c,
                humidity = raw.humidity_pct,
                "climate sensor returned NaN, reading marked invalid"
            );
        }
        reading
    }

    pub fn set_watering(&mut self, active: bool) {
        self.transducers.set_watering(active);
    }

    #[cfg(test)]
    pub fn transducers(&self) -> &T {
        &self.transducers
    }
}

/// Pure transformation from raw counts to a [`Reading`].
pub fn calibrate(
    raw: &RawSample,
    cal: &Calibration,
    battery: &BatteryDivider,
    captured_at_ms: u64,
) -> Reading {
    let temperature_c = raw.temperature_c + cal.temp_offset;
    let humidity_pct = raw.humidity_pct + cal.hum_offset;

    Reading {
        soil_moisture_pct: map_to_percent(raw.soil, cal.soil_min, cal.soil_max),
        temperature_c,
        humidity_pct,
        light_pct: map_to_percent(raw.light, cal.light_min, cal.light_max),
        battery_pct: battery.percent(raw.battery),
        captured_at_ms,
        valid: !temperature_c.is_nan() && !humidity_pct.is_nan(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Replays a fixed sample and records pump feedback.
    pub(crate) struct FixedTransducers {
        pub(crate) sample: RawSample,
        pub(crate) watering: bool,
    }

    impl FixedTransducers {
        pub(crate) fn new(sample: RawSample) -> Self {
            Self {
                sample,
                watering: false,
            }
        }
    }

    impl Transducers for FixedTransducers {
        fn read(&mut self) -> RawSample {
            self.sample
        }

        fn set_watering(&mut self, active: bool) {
            self.watering = active;
        }
    }

    pub(crate) fn good_sample() -> RawSample {
        RawSample {
            soil: 512,
            light: 256,
            battery: 589, // ~3.8 V through a 2:1 divider at 3.3 V / 1024
            temperature_c: 21.5,
            humidity_pct: 48.0,
        }
    }

    #[test]
    fn default_calibration_midpoint_soil() {
        let r = calibrate(
            &good_sample(),
            &Calibration::default(),
            &BatteryDivider::default(),
            0,
        );
        assert_eq!(r.soil_moisture_pct, 50.0);
        assert_eq!(r.light_pct, 25.0);
        assert!(r.valid);
    }

    #[test]
    fn offsets_are_additive() {
        let cal = Calibration {
            temp_offset: -1.5,
            hum_offset: 2.0,
            ..Calibration::default()
        };
        let r = calibrate(&good_sample(), &cal, &BatteryDivider::default(), 0);
        assert_eq!(r.temperature_c, 20.0);
        assert_eq!(r.humidity_pct, 50.0);
    }

    #[test]
    fn out_of_range_raw_saturates() {
        let cal = Calibration {
            soil_min: 300,
            soil_max: 800,
            light_min: 100,
            light_max: 900,
            ..Calibration::default()
        };
        let high = RawSample {
            soil: 4095,
            light: 4095,
            ..good_sample()
        };
        let low = RawSample {
            soil: 0,
            light: -10,
            ..good_sample()
        };
        let b = BatteryDivider::default();
        let r = calibrate(&high, &cal, &b, 0);
        assert_eq!((r.soil_moisture_pct, r.light_pct), (100.0, 100.0));
        let r = calibrate(&low, &cal, &b, 0);
        assert_eq!((r.soil_moisture_pct, r.light_pct), (0.0, 0.0));
    }

    #[test]
    fn battery_window_maps_and_clamps() {
        let b = BatteryDivider::default();
        // 3.7 V at the battery is 1.85 V at the pin: 1.85 / 3.3 * 1024.
        let mid = (1.85_f32 / 3.3 * 1024.0).round() as i32;
        let pct = b.percent(mid);
        assert!((pct - 50.0).abs() < 0.5, "mid battery pct = {pct}");
        assert_eq!(b.percent(0), 0.0);
        assert_eq!(b.percent(1023), 100.0);
    }

    #[test]
    fn nan_temperature_invalidates() {
        let raw = RawSample {
            temperature_c: f32::NAN,
            ..good_sample()
        };
        let r = calibrate(&raw, &Calibration::default(), &BatteryDivider::default(), 0);
        assert!(!r.valid);
    }

    #[test]
    fn nan_humidity_invalidates() {
        let raw = RawSample {
            humidity_pct: f32::NAN,
            ..good_sample()
        };
        let r = calibrate(&raw, &Calibration::default(), &BatteryDivider::default(), 0);
        assert!(!r.valid);
    }

    #[test]
    fn reader_stamps_capture_time() {
        let mut reader =
            SensorReader::new(FixedTransducers::new(good_sample()), BatteryDivider::default());
        let r = reader.sample(&Calibration::default(), 12_345);
        assert_eq!(r.captured_at_ms, 12_345);
        assert!(r.valid);
    }

    #[test]
    fn reader_forwards_watering_feedback() {
        let mut reader =
            SensorReader::new(FixedTransducers::new(good_sample()), BatteryDivider::default());
        reader.set_watering(true);
        assert!(reader.transducers.watering);
    }
}
