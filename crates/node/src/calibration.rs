//! Persistent calibration record backed by SQLite.
//!
//! The record is a fixed set of key/value pairs (`soil_min`, `soil_max`,
//! `temp_offset`, `hum_offset`, `light_min`, `light_max`).  It is read once
//! at start-up and written only by an explicit [`CalibrationStore::save`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

pub const KEY_SOIL_MIN: &str = "soil_min";
pub const KEY_SOIL_MAX: &str = "soil_max";
pub const KEY_TEMP_OFFSET: &str = "temp_offset";
pub const KEY_HUM_OFFSET: &str = "hum_offset";
pub const KEY_LIGHT_MIN: &str = "light_min";
pub const KEY_LIGHT_MAX: &str = "light_max";

pub const KEYS: [&str; 6] = [
    KEY_SOIL_MIN,
    KEY_SOIL_MAX,
    KEY_TEMP_OFFSET,
    KEY_HUM_OFFSET,
    KEY_LIGHT_MIN,
    KEY_LIGHT_MAX,
];

/// Linear mapping parameters converting raw transducer units to percentages
/// and additive offsets for the climate sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub soil_min: i32,
    pub soil_max: i32,
    pub light_min: i32,
    pub light_max: i32,
    pub temp_offset: f32,
    pub hum_offset: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            soil_min: 0,
            soil_max: 1024,
            light_min: 0,
            light_max: 1024,
            temp_offset: 0.0,
            hum_offset: 0.0,
        }
    }
}

impl Calibration {
    /// Apply a single `key = value` update.  Integer keys reject fractional
    /// values so a typo like `soil_max=9.5` is caught instead of truncated.
    pub fn set(&mut self, key: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            bail!("calibration value for '{key}' must be finite, got {value}");
        }

        let as_int = || -> Result<i32> {
            if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
                bail!("calibration key '{key}' expects an integer, got {value}");
            }
            Ok(value as i32)
        };

        match key {
            KEY_SOIL_MIN => self.soil_min = as_int()?,
            KEY_SOIL_MAX => self.soil_max = as_int()?,
            KEY_LIGHT_MIN => self.light_min = as_int()?,
            KEY_LIGHT_MAX => self.light_max = as_int()?,
            KEY_TEMP_OFFSET => self.temp_offset = value as f32,
            KEY_HUM_OFFSET => self.hum_offset = value as f32,
            _ => bail!(
                "unknown calibration key '{key}' (expected one of: {})",
                KEYS.join(", ")
            ),
        }
        Ok(())
    }

    fn get(&self, key: &str) -> f64 {
        match key {
            KEY_SOIL_MIN => self.soil_min as f64,
            KEY_SOIL_MAX => self.soil_max as f64,
            KEY_LIGHT_MIN => self.light_min as f64,
            KEY_LIGHT_MAX => self.light_max as f64,
            KEY_TEMP_OFFSET => self.temp_offset as f64,
            KEY_HUM_OFFSET => self.hum_offset as f64,
            _ => 0.0,
        }
    }
}

/// Map `raw` linearly from `[min, max]` onto `[0, 100]` and clamp.
///
/// Inverted ranges (`min > max`) are fine; a zero-width range yields 0.
pub fn map_to_percent(raw: i32, min: i32, max: i32) -> f32 {
    let range = max as f64 - min as f64;
    if range == 0.0 {
        return 0.0;
    }
    let pct = (raw as f64 - min as f64) * 100.0 / range;
    pct.clamp(0.0, 100.0) as f32
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CalibrationStore {
    pool: Pool<Sqlite>,
}

impl CalibrationStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden-node/calibration.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn open(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // One connection: a single reader per cycle, and it keeps
        // `sqlite::memory:` databases alive across queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open calibration store: {db_url}"))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run calibration migrations")?;
        Ok(())
    }

    /// Load the persisted record.  Keys that were never saved keep their
    /// defaults, so a fresh device boots with [`Calibration::default`].
    pub async fn load(&self) -> Result<Calibration> {
        let rows: Vec<(String, f64)> = sqlx::query_as("SELECT key, value FROM calibration")
            .fetch_all(&self.pool)
            .await
            .context("load calibration failed")?;

        let mut cal = Calibration::default();
        for (key, value) in rows {
            if let Err(e) = cal.set(&key, value) {
                tracing::warn!(%key, value, "ignoring stored calibration entry: {e:#}");
            }
        }

        tracing::info!(
            soil_min = cal.soil_min,
            soil_max = cal.soil_max,
            light_min = cal.light_min,
            light_max = cal.light_max,
            temp_offset = cal.temp_offset,
            hum_offset = cal.hum_offset,
            "calibration loaded"
        );
        Ok(cal)
    }

    /// Overwrite every key with the values in `cal`.
    pub async fn save(&self, cal: &Calibration) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin calibration save")?;
        for key in KEYS {
            sqlx::query(
                r#"
                INSERT INTO calibration (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(cal.get(key))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save calibration key '{key}' failed"))?;
        }
        tx.commit().await.context("commit calibration save")?;

        tracing::info!("calibration saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
