//! Applies decoded commands to the actuators.
//!
//! ## Pump state machine
//!
//! ```text
//! Idle ──[Water{d}, 1 <= d <= max]──▶ Watering{until = now + d}
//!  ▲                                        │
//!  └──────[service_pump(): now >= until]────┘
//!  └──────[cancel_watering()]───────────────┘
//! ```
//!
//! The deadline is checked on every scheduler tick instead of sleeping for
//! the whole duration, so the loop keeps servicing its other duties and a
//! running pump can be cancelled.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::actuator::{brightness_to_level, ActuatorBoard};
use crate::commands::{Action, Command};
use crate::config::{LightConfig, PumpConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Watering { since: Instant, until: Instant },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandRejected {
    #[error("watering duration {requested}s outside [1, {max}]")]
    DurationOutOfRange { requested: f64, max: u64 },
}

/// What executing one command did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    /// The caller should send telemetry now, outside the normal interval.
    StatusRequested,
    Rejected(CommandRejected),
    /// Unknown action; nothing touched.
    Ignored,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorLimits {
    pub default_water_sec: u64,
    pub max_water_sec: u64,
    pub default_on_brightness: u8,
    pub default_set_brightness: u8,
}

impl ExecutorLimits {
    pub fn new(pump: &PumpConfig, lights: &LightConfig) -> Self {
        Self {
            default_water_sec: pump.default_duration_sec,
            max_water_sec: pump.max_duration_sec,
            default_on_brightness: lights.default_on_brightness,
            default_set_brightness: lights.default_set_brightness,
        }
    }
}

pub struct CommandExecutor {
    board: ActuatorBoard,
    pump: PumpState,
    limits: ExecutorLimits,
}

impl CommandExecutor {
    pub fn new(board: ActuatorBoard, limits: ExecutorLimits) -> Self {
        Self {
            board,
            pump: PumpState::Idle,
            limits,
        }
    }

    #[cfg(test)]
    pub fn board(&self) -> &ActuatorBoard {
        &self.board
    }

    #[cfg(test)]
    pub fn pump_state(&self) -> PumpState {
        self.pump
    }

    pub fn is_watering(&self) -> bool {
        matches!(self.pump, PumpState::Watering { .. })
    }

    /// When the running watering cycle ends, if any.
    pub fn pump_deadline(&self) -> Option<Instant> {
        match self.pump {
            PumpState::Watering { until, .. } => Some(until),
            PumpState::Idle => None,
        }
    }

    pub fn execute(&mut self, cmd: &Command) -> Outcome {
        tracing::info!(action = %cmd.action, params = ?cmd.parameters, "executing command");

        match &cmd.action {
            Action::Water => {
                let requested = cmd
                    .param("duration")
                    .unwrap_or(self.limits.default_water_sec as f64);
                match self.start_watering(requested) {
                    Ok(()) => Outcome::Applied,
                    Err(e) => {
                        tracing::warn!("water command rejected: {e}");
                        Outcome::Rejected(e)
                    }
                }
            }
            Action::LightOn => {
                let b = cmd
                    .param("brightness")
                    .unwrap_or(self.limits.default_on_brightness as f64);
                self.set_brightness(b);
                Outcome::Applied
            }
            Action::LightOff => {
                self.set_brightness(0.0);
                Outcome::Applied
            }
            Action::SetLightBrightness => {
                let b = cmd
                    .param("brightness")
                    .unwrap_or(self.limits.default_set_brightness as f64);
                self.set_brightness(b);
                Outcome::Applied
            }
            Action::GetStatus => Outcome::StatusRequested,
            Action::Unknown(name) => {
                tracing::warn!(action = %name, "unknown command ignored");
                Outcome::Ignored
            }
        }
    }

    /// Run a batch in order.  Returns true if any command asked for an
    /// immediate status report.
    pub fn execute_all(&mut self, cmds: &[Command]) -> bool {
        let mut report_now = false;
        for cmd in cmds {
            if self.execute(cmd) == Outcome::StatusRequested {
                report_now = true;
            }
        }
        report_now
    }

    /// Turn the pump off once its deadline has passed.  Returns true on the
    /// tick that ends a watering cycle.
    pub fn service_pump(&mut self) -> bool {
        let PumpState::Watering { since, until } = self.pump else {
            return false;
        };
        if Instant::now() < until {
            return false;
        }

        self.board.set_pump(false);
        self.pump = PumpState::Idle;
        tracing::info!(
            ran_sec = since.elapsed().as_secs_f64(),
            "watering complete"
        );
        true
    }

    pub fn cancel_watering(&mut self) {
        if let PumpState::Watering { since, .. } = self.pump {
            self.board.set_pump(false);
            self.pump = PumpState::Idle;
            tracing::warn!(
                ran_sec = since.elapsed().as_secs_f64(),
                "watering cancelled"
            );
        }
    }

    /// Fail-safe: pump and lights off.
    pub fn shutdown(&mut self) {
        self.cancel_watering();
        self.board.all_off();
    }

    fn start_watering(&mut self, requested: f64) -> Result<(), CommandRejected> {
        let max = self.limits.max_water_sec;
        if !(1.0..=max as f64).contains(&requested) {
            return Err(CommandRejected::DurationOutOfRange { requested, max });
        }

        let now = Instant::now();
        let until = now + Duration::from_secs_f64(requested);
        let since = match self.pump {
            // A new request while running replaces the deadline.
            PumpState::Watering { since, .. } => since,
            PumpState::Idle => {
                self.board.set_pump(true);
                now
            }
        };
        self.pump = PumpState::Watering { since, until };

        tracing::info!(duration_sec = requested, "watering started");
        Ok(())
    }

    fn set_brightness(&mut self, brightness: f64) {
        let level = brightness_to_level(brightness);
        self.board.set_light_level(level);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::actuator::ActuatorChange;

    fn executor() -> CommandExecutor {
        let pump = PumpConfig::default();
        let lights = LightConfig::default();
        CommandExecutor::new(
            ActuatorBoard::new(&pump, &lights).unwrap(),
            ExecutorLimits::new(&pump, &lights),
        )
    }

    fn water(secs: f64) -> Command {
        Command::new(Action::Water).with("duration", secs)
    }

    // -- Lights -----------------------------------------------------------

    #[test]
    fn light_on_then_off_nets_off() {
        let mut ex = executor();
        ex.execute_all(&[
            Command::new(Action::LightOn).with("brightness", 80.0),
            Command::new(Action::LightOff),
        ]);
        assert_eq!(ex.board().light_level(), 0);
        assert_eq!(
            ex.board().history,
            vec![ActuatorChange::Light(204), ActuatorChange::Light(0)]
        );
    }

    #[test]
    fn brightness_150_equals_100() {
        let mut a = executor();
        let mut b = executor();
        a.execute(&Command::new(Action::SetLightBrightness).with("brightness", 150.0));
        b.execute(&Command::new(Action::SetLightBrightness).with("brightness", 100.0));
        assert_eq!(a.board().light_level(), b.board().light_level());
        assert_eq!(a.board().light_level(), 255);
    }

    #[test]
    fn light_defaults() {
        let mut ex = executor();
        ex.execute(&Command::new(Action::LightOn));
        assert_eq!(ex.board().light_level(), brightness_to_level(80.0));
        ex.execute(&Command::new(Action::SetLightBrightness));
        assert_eq!(ex.board().light_level(), brightness_to_level(50.0));
    }

    // -- Unknown / status ---------------------------------------------------

    #[test]
    fn unknown_has_no_effect_and_batch_continues() {
        let mut ex = executor();
        let outcome = ex.execute(&Command::new(Action::Unknown("reboot".into())));
        assert_eq!(outcome, Outcome::Ignored);
        assert!(ex.board().history.is_empty());

        ex.execute_all(&[
            Command::new(Action::Unknown("dance".into())),
            Command::new(Action::LightOn).with("brightness", 100.0),
        ]);
        assert_eq!(ex.board().light_level(), 255);
    }

    #[test]
    fn get_status_requests_report_without_actuation() {
        let mut ex = executor();
        assert_eq!(
            ex.execute(&Command::new(Action::GetStatus)),
            Outcome::StatusRequested
        );
        assert!(ex.board().history.is_empty());
        assert!(ex.execute_all(&[
            Command::new(Action::LightOff),
            Command::new(Action::GetStatus)
        ]));
        assert!(!ex.execute_all(&[Command::new(Action::LightOff)]));
    }

    // -- Pump -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn watering_runs_until_deadline() {
        let mut ex = executor();
        assert_eq!(ex.execute(&water(10.0)), Outcome::Applied);
        assert!(ex.board().pump_on());
        assert!(ex.is_watering());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!ex.service_pump());
        assert!(ex.board().pump_on());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ex.service_pump());
        assert!(!ex.board().pump_on());
        assert_eq!(ex.pump_state(), PumpState::Idle);
        assert!(!ex.service_pump());
    }

    #[tokio::test(start_paused = true)]
    async fn water_default_duration() {
        let mut ex = executor();
        ex.execute(&Command::new(Action::Water));
        let deadline = ex.pump_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn water_over_max_rejected() {
        let mut ex = executor();
        let outcome = ex.execute(&water(301.0));
        assert_eq!(
            outcome,
            Outcome::Rejected(CommandRejected::DurationOutOfRange {
                requested: 301.0,
                max: 300
            })
        );
        assert!(!ex.board().pump_on());
        assert!(ex.board().history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn water_below_one_rejected() {
        let mut ex = executor();
        assert!(matches!(ex.execute(&water(0.0)), Outcome::Rejected(_)));
        assert!(matches!(ex.execute(&water(-5.0)), Outcome::Rejected(_)));
        assert!(matches!(ex.execute(&water(f64::NAN)), Outcome::Rejected(_)));
        assert!(!ex.is_watering());
    }

    #[tokio::test(start_paused = true)]
    async fn water_at_max_accepted() {
        let mut ex = executor();
        assert_eq!(ex.execute(&water(300.0)), Outcome::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn second_water_replaces_deadline() {
        let mut ex = executor();
        ex.execute(&water(10.0));
        tokio::time::advance(Duration::from_secs(5)).await;
        ex.execute(&water(10.0));
        // Pump switched on once only.
        assert_eq!(ex.board().history, vec![ActuatorChange::Pump(true)]);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!ex.service_pump());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(ex.service_pump());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_water_keeps_running_cycle() {
        let mut ex = executor();
        ex.execute(&water(10.0));
        let deadline = ex.pump_deadline();
        ex.execute(&water(1000.0));
        assert_eq!(ex.pump_deadline(), deadline);
        assert!(ex.board().pump_on());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pump() {
        let mut ex = executor();
        ex.execute(&water(60.0));
        ex.cancel_watering();
        assert!(!ex.board().pump_on());
        assert!(!ex.is_watering());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_turns_everything_off() {
        let mut ex = executor();
        ex.execute(&water(60.0));
        ex.execute(&Command::new(Action::LightOn));
        ex.shutdown();
        assert!(!ex.board().pump_on());
        assert_eq!(ex.board().light_level(), 0);
    }
}
