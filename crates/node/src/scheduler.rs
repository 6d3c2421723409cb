//! Cooperative control loop.
//!
//! One task, one duty at a time.  Each iteration runs, in order:
//!
//! 1. update hook (a transfer in progress suppresses steps 3-5)
//! 2. pump deadline
//! 3. sensor read + telemetry report, every `sensor_interval`
//! 4. command poll + execution, every `command_interval`
//! 5. connectivity check
//!
//! then sleeps for the idle delay, shortened while the pump runs so the
//! watering deadline is met within one iteration.

use std::future::Future;
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::calibration::Calibration;
use crate::commands::CommandPoller;
use crate::config::Config;
use crate::connectivity::{ConnectivityManager, Link};
use crate::executor::CommandExecutor;
use crate::identity::DeviceIdentity;
use crate::sensor::{Reading, SensorReader, Transducers};
use crate::telemetry::{ReportOutcome, TelemetryReporter};
use crate::transport::Transport;
use crate::update::{UpdateAgent, UpdateSource};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Session state owned by the scheduler and lent to each component call.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub identity: DeviceIdentity,
    /// Read-only snapshot for this session; the store is only written by
    /// the `calibrate` subcommand.
    pub calibration: Calibration,
    pub last_sensor_run: Option<Instant>,
    pub last_command_run: Option<Instant>,
    pub last_reading: Option<Reading>,
    pub boot: Instant,
    pub booted_at: OffsetDateTime,
}

impl DeviceContext {
    pub fn new(identity: DeviceIdentity, calibration: Calibration) -> Self {
        Self {
            identity,
            calibration,
            last_sensor_run: None,
            last_command_run: None,
            last_reading: None,
            boot: Instant::now(),
            booted_at: OffsetDateTime::now_utc(),
        }
    }

    /// Milliseconds since the agent started; the telemetry timestamp.
    pub fn uptime_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(t) => now.duration_since(t) >= interval,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub sensor: Duration,
    pub command: Duration,
    pub idle: Duration,
}

impl From<&Config> for Intervals {
    fn from(cfg: &Config) -> Self {
        Self {
            sensor: cfg.sensor_interval(),
            command: cfg.command_interval(),
            idle: cfg.idle_delay(),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub update_in_progress: bool,
    pub watering_finished: bool,
    pub sensed: bool,
    pub polled: bool,
    pub status_reported: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<T, L, H, S> {
    ctx: DeviceContext,
    reader: SensorReader<T>,
    connectivity: ConnectivityManager<L>,
    reporter: TelemetryReporter<H>,
    poller: CommandPoller<H>,
    executor: CommandExecutor,
    updates: UpdateAgent<S>,
    intervals: Intervals,
}

impl<T, L, H, S> Scheduler<T, L, H, S>
where
    T: Transducers,
    L: Link,
    H: Transport + Clone,
    S: UpdateSource,
{
    pub fn new(
        ctx: DeviceContext,
        reader: SensorReader<T>,
        connectivity: ConnectivityManager<L>,
        transport: H,
        executor: CommandExecutor,
        updates: UpdateAgent<S>,
        intervals: Intervals,
    ) -> Self {
        Self {
            ctx,
            reader,
            connectivity,
            reporter: TelemetryReporter::new(transport.clone()),
            poller: CommandPoller::new(transport),
            executor,
            updates,
            intervals,
        }
    }

    #[cfg(test)]
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    #[cfg(test)]
    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    #[cfg(test)]
    pub fn reader(&self) -> &SensorReader<T> {
        &self.reader
    }

    #[cfg(test)]
    pub fn connectivity(&self) -> &ConnectivityManager<L> {
        &self.connectivity
    }

    /// Run one iteration.
    pub async fn tick(&mut self) -> Tick {
        let mut tick = Tick::default();

        if self.updates.service() {
            tick.update_in_progress = true;
            // Pump safety still applies during a transfer.
            tick.watering_finished = self.service_pump();
            return tick;
        }

        tick.watering_finished = self.service_pump();

        let now = Instant::now();
        if due(self.ctx.last_sensor_run, self.intervals.sensor, now) {
            self.ctx.last_sensor_run = Some(now);
            self.sense_and_report().await;
            tick.sensed = true;
        }

        if due(self.ctx.last_command_run, self.intervals.command, now) {
            self.ctx.last_command_run = Some(now);
            tick.polled = true;
            if self.poll_and_execute().await {
                tracing::info!("status requested, reporting now");
                self.sense_and_report().await;
                tick.status_reported = true;
            }
        }

        self.connectivity.refresh().await;
        tick
    }

    /// Connect, then loop until `shutdown` resolves.  Actuators are switched
    /// off on the way out.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        tracing::info!(
            device = %self.ctx.identity.mac_address,
            host = %self.ctx.identity.hostname(),
            booted_at = %self.ctx.booted_at.format(&Rfc3339).unwrap_or_default(),
            sensor_sec = self.intervals.sensor.as_secs(),
            command_sec = self.intervals.command.as_secs(),
            "scheduler started"
        );

        tokio::select! {
            _ = &mut shutdown => {
                self.stop();
                return;
            }
            _ = self.connectivity.ensure_connected() => {}
        }
        tracing::info!(
            state = %self.connectivity.status(),
            address = self.connectivity.address().unwrap_or("none"),
            "network ready"
        );

        loop {
            let tick = self.tick().await;
            if tick != Tick::default() {
                tracing::trace!(
                    update = tick.update_in_progress,
                    watering_done = tick.watering_finished,
                    sensed = tick.sensed,
                    polled = tick.polled,
                    status = tick.status_reported,
                    "tick"
                );
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.idle_delay()) => {}
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.executor.shutdown();
        self.reader.set_watering(false);
        tracing::info!(
            uptime_sec = self.ctx.boot.elapsed().as_secs(),
            "scheduler stopped, actuators off"
        );
    }

    /// Idle delay for the next sleep, cut short by a pending pump deadline.
    pub fn idle_delay(&self) -> Duration {
        match self.executor.pump_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.intervals.idle),
            None => self.intervals.idle,
        }
    }

    fn service_pump(&mut self) -> bool {
        let finished = self.executor.service_pump();
        if finished {
            self.reader.set_watering(false);
        }
        finished
    }

    async fn sense_and_report(&mut self) -> ReportOutcome {
        let reading = self
            .reader
            .sample(&self.ctx.calibration, self.ctx.uptime_ms());
        self.ctx.last_reading = Some(reading);
        self.reporter
            .report(&reading, &self.ctx.identity, self.connectivity.status())
            .await
    }

    /// Returns true if the batch asked for an immediate status report.
    async fn poll_and_execute(&mut self) -> bool {
        let commands = self
            .poller
            .poll(&self.ctx.identity, self.connectivity.status())
            .await;
        if commands.is_empty() {
            return false;
        }

        let report_now = self.executor.execute_all(&commands);
        self.reader.set_watering(self.executor.is_watering());
        report_now
    }
}

// ===========================================================================
// Tests
// ===========================================================================
