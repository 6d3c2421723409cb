//! I2C transducers on a Raspberry Pi: an ADS1115 16-bit ADC for the soil,
//! light and battery channels, and an SHT4x for temperature/humidity.
//!
//! The ADS1115 reads single-ended channels at PGA ±4.096 V, 128 SPS,
//! single-shot mode.  Set `adc.full_scale` to the count that corresponds to
//! `adc.reference_volts` (about 26400 for 3.3 V at this gain) so the battery
//! divider maths stays right.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::config::AdcConfig;
use crate::sensor::{RawSample, Transducers};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       : write 1 to start single-shot conversion
//   [14:12] MUX      : input multiplexer (channel selection)
//   [11:9]  PGA      : programmable gain amplifier
//   [8]     MODE     : 0 = continuous, 1 = single-shot
//   [7:5]   DR       : data rate
//   [4:2]   comparator mode/polarity/latch
//   [1:0]   COMP_QUE : 11 = disable comparator (default)

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register reads back as the conversion-ready flag.
const OS_READY_BIT: u16 = 1 << 15;

// ── SHT4x ───────────────────────────────────────────────────────────────────

/// Measure T & RH with high precision.
const SHT4X_MEASURE_HIGH: u8 = 0xFD;
/// Max measurement duration at high precision is 8.3 ms.
const SHT4X_MEASURE_WAIT: Duration = Duration::from_millis(10);

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// CRC-8, polynomial 0x31, init 0xFF (Sensirion).
fn sensirion_crc(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
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

/// Decode a 6-byte SHT4x frame into (°C, %RH).  NaN on CRC mismatch.
fn decode_sht4x(frame: &[u8; 6]) -> (f32, f32) {
    if sensirion_crc(&frame[0..2]) != frame[2] || sensirion_crc(&frame[3..5]) != frame[5] {
        return (f32::NAN, f32::NAN);
    }
    let t_ticks = u16::from_be_bytes([frame[0], frame[1]]) as f32;
    let rh_ticks = u16::from_be_bytes([frame[3], frame[4]]) as f32;
    let t = -45.0 + 175.0 * t_ticks / 65535.0;
    let rh = (-6.0 + 125.0 * rh_ticks / 65535.0).clamp(0.0, 100.0);
    (t, rh)
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Both chips on I2C bus 1, addressed in turn.
pub struct I2cTransducers {
    i2c: I2c,
    cfg: AdcConfig,
}

impl I2cTransducers {
    pub fn new(cfg: &AdcConfig) -> anyhow::Result<Self> {
        let i2c = I2c::new()?;

        tracing::info!(
            ads1115 = format_args!("0x{:02x}", cfg.i2c_address),
            sht4x = format_args!("0x{:02x}", cfg.sht4x_address),
            soil = cfg.soil_channel,
            light = cfg.light_channel,
            battery = cfg.battery_channel,
            "i2c transducers initialised"
        );

        Ok(Self {
            i2c,
            cfg: cfg.clone(),
        })
    }

    /// Single-shot read on `channel`, returning the raw signed value
    /// (0–32767 for single-ended).
    fn read_channel(&mut self, channel: usize) -> anyhow::Result<i16> {
        self.i2c.set_slave_address(self.cfg.i2c_address)?;
        let config = config_for_channel(channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    /// A failed channel reads as 0, which saturates to the bottom of its
    /// percentage range.
    fn analog(&mut self, channel: usize, name: &'static str) -> i32 {
        match self.read_channel(channel) {
            Ok(raw) => (raw as i32).clamp(0, i16::MAX as i32),
            Err(e) => {
                tracing::error!(channel, sensor = name, "adc read failed: {e}");
                0
            }
        }
    }

    fn read_climate(&mut self) -> anyhow::Result<(f32, f32)> {
        self.i2c.set_slave_address(self.cfg.sht4x_address)?;
        self.i2c.write(&[SHT4X_MEASURE_HIGH])?;
        thread::sleep(SHT4X_MEASURE_WAIT);
        let mut frame = [0u8; 6];
        self.i2c.read(&mut frame)?;
        Ok(decode_sht4x(&frame))
    }
}

impl Transducers for I2cTransducers {
    fn read(&mut self) -> RawSample {
        let soil = self.analog(self.cfg.soil_channel, "soil");
        let light = self.analog(self.cfg.light_channel, "light");
        let battery = self.analog(self.cfg.battery_channel, "battery");

        let (temperature_c, humidity_pct) = self.read_climate().unwrap_or_else(|e| {
            tracing::error!("sht4x read failed: {e}");
            (f32::NAN, f32::NAN)
        });

        RawSample {
            soil,
            light,
            battery,
            temperature_c,
            humidity_pct,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_channels() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }

    #[test]
    fn crc_matches_datasheet_example() {
        // Sensirion datasheet: CRC(0xBEEF) = 0x92.
        assert_eq!(sensirion_crc(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn decode_valid_frame() {
        let t = 0x6666u16.to_be_bytes(); // ~25 °C
        let rh = 0x8000u16.to_be_bytes(); // ~56.5 %RH
        let frame = [
            t[0],
            t[1],
            sensirion_crc(&t),
            rh[0],
            rh[1],
            sensirion_crc(&rh),
        ];
        let (temp, hum) = decode_sht4x(&frame);
        assert!((temp - 25.0).abs() < 0.1, "temp = {temp}");
        assert!((hum - 56.5).abs() < 0.1, "hum = {hum}");
    }

    #[test]
    fn decode_bad_crc_is_nan() {
        let frame = [0x66, 0x66, 0x00, 0x80, 0x00, 0x00];
        let (temp, hum) = decode_sht4x(&frame);
        assert!(temp.is_nan());
        assert!(hum.is_nan());
    }
}
