//! Pushes calibrated readings to `POST {base}/sensors/data`.
//!
//! Outcomes are classified at the transport layer: any HTTP status counts as
//! delivered, even a non-2xx one.  The `accepted` flag on
//! [`ReportOutcome::Delivered`] carries the application-level verdict for
//! diagnostics only; nothing is retried within a cycle.

use serde::Serialize;

use crate::connectivity::ConnectionState;
use crate::identity::DeviceIdentity;
use crate::sensor::Reading;
use crate::transport::{
    Method, Request, Transport, TransportError, HEADER_DEVICE_KEY, HEADER_DEVICE_MAC,
};

pub const TELEMETRY_PATH: &str = "/sensors/data";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorValues {
    soil_moisture: f32,
    temperature: f32,
    humidity: f32,
    light_level: f32,
    battery_level: f32,
}

#[derive(Debug, Serialize)]
struct TelemetryMsg {
    timestamp: u64,
    sensors: SensorValues,
}

impl From<&Reading> for TelemetryMsg {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.captured_at_ms,
            sensors: SensorValues {
                soil_moisture: r.soil_moisture_pct,
                temperature: r.temperature_c,
                humidity: r.humidity_pct,
                light_level: r.light_pct,
                battery_level: r.battery_pct,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disconnected,
    InvalidReading,
}

#[derive(Debug)]
pub enum ReportOutcome {
    /// Preconditions not met; nothing was sent.
    Skipped(SkipReason),
    /// The server answered with some status.
    Delivered {
        status: u16,
        accepted: bool,
        body: String,
    },
    /// The request never got a status.  Retried on the next interval.
    Failed(TransportError),
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

pub struct TelemetryReporter<T> {
    transport: T,
}

impl<T: Transport> TelemetryReporter<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn report(
        &self,
        reading: &Reading,
        identity: &DeviceIdentity,
        link: ConnectionState,
    ) -> ReportOutcome {
        if link != ConnectionState::Connected {
            tracing::info!("telemetry skipped: not connected");
            return ReportOutcome::Skipped(SkipReason::Disconnected);
        }
        if !reading.valid {
            tracing::warn!("telemetry skipped: invalid reading");
            return ReportOutcome::Skipped(SkipReason::InvalidReading);
        }

        let body = match serde_json::to_vec(&TelemetryMsg::from(reading)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("telemetry serialisation failed: {e}");
                return ReportOutcome::Failed(TransportError::Other(e.to_string()));
            }
        };

        let request = Request {
            method: Method::Post,
            url: identity.url(TELEMETRY_PATH),
            headers: auth_headers(identity),
            body: Some(body),
        };

        match self.transport.send(request).await {
            Ok(resp) => {
                let accepted = (200..300).contains(&resp.status);
                if accepted {
                    tracing::info!(
                        status = resp.status,
                        ts = reading.captured_at_ms,
                        "telemetry delivered"
                    );
                } else {
                    tracing::warn!(
                        status = resp.status,
                        body = %resp.body,
                        "telemetry delivered but not accepted"
                    );
                }
                tracing::debug!(body = %resp.body, "telemetry response");
                ReportOutcome::Delivered {
                    status: resp.status,
                    accepted,
                    body: resp.body,
                }
            }
            Err(e) => {
                tracing::error!("telemetry send failed: {e}");
                ReportOutcome::Failed(e)
            }
        }
    }
}

pub(crate) fn auth_headers(identity: &DeviceIdentity) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_DEVICE_KEY, identity.device_key.clone()),
        (HEADER_DEVICE_MAC, identity.mac_address.clone()),
    ]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("a4:cf:12:b3:c0:de", "secret", "https://garden.example/api").unwrap()
    }

    fn reading() -> Reading {
        Reading {
            soil_moisture_pct: 42.0,
            temperature_c: 21.5,
            humidity_pct: 55.0,
            light_pct: 80.0,
            battery_pct: 90.0,
            captured_at_ms: 30_000,
            valid: true,
        }
    }

    #[test]
    fn payload_shape() {
        let json = serde_json::to_value(TelemetryMsg::from(&reading())).unwrap();
        assert_eq!(json["timestamp"], 30_000);
        let sensors = json["sensors"].as_object().unwrap();
        assert_eq!(sensors.len(), 5);
        assert_eq!(sensors["soilMoisture"], 42.0);
        assert_eq!(sensors["temperature"], 21.5);
        assert_eq!(sensors["humidity"], 55.0);
        assert_eq!(sensors["lightLevel"], 80.0);
        assert_eq!(sensors["batteryLevel"], 90.0);
    }

    #[tokio::test]
    async fn posts_with_auth_headers() {
        let reporter = TelemetryReporter::new(FakeTransport::new());
        reporter.transport().respond(200, "{\"ok\":true}");

        let outcome = reporter
            .report(&reading(), &identity(), ConnectionState::Connected)
            .await;
        assert!(matches!(
            outcome,
            ReportOutcome::Delivered {
                status: 200,
                accepted: true,
                ..
            }
        ));

        let sent = reporter.transport().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::Post);
        assert_eq!(sent[0].url, "https://garden.example/api/sensors/data");
        assert!(sent[0]
            .headers
            .contains(&("X-Device-Key", "secret".to_string())));
        assert!(sent[0]
            .headers
            .contains(&("X-Device-MAC", "A4CF12B3C0DE".to_string())));
        let body: serde_json::Value =
            serde_json::from_slice(sent[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["sensors"]["soilMoisture"], 42.0);
    }

    #[tokio::test]
    async fn invalid_reading_never_sent() {
        let reporter = TelemetryReporter::new(FakeTransport::new());
        let bad = Reading {
            valid: false,
            temperature_c: f32::NAN,
            ..reading()
        };
        let outcome = reporter
            .report(&bad, &identity(), ConnectionState::Connected)
            .await;
        assert!(matches!(
            outcome,
            ReportOutcome::Skipped(SkipReason::InvalidReading)
        ));
        assert!(reporter.transport().sent().is_empty());
    }

    #[tokio::test]
    async fn disconnected_skips() {
        let reporter = TelemetryReporter::new(FakeTransport::new());
        for state in [ConnectionState::Disconnected, ConnectionState::Connecting] {
            let outcome = reporter.report(&reading(), &identity(), state).await;
            assert!(matches!(
                outcome,
                ReportOutcome::Skipped(SkipReason::Disconnected)
            ));
        }
        assert!(reporter.transport().sent().is_empty());
    }

    #[tokio::test]
    async fn server_error_still_counts_as_delivered() {
        let reporter = TelemetryReporter::new(FakeTransport::new());
        reporter.transport().respond(500, "boom");
        let outcome = reporter
            .report(&reading(), &identity(), ConnectionState::Connected)
            .await;
        match outcome {
            ReportOutcome::Delivered {
                status,
                accepted,
                body,
            } => {
                assert_eq!(status, 500);
                assert!(!accepted);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Delivered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let reporter = TelemetryReporter::new(FakeTransport::new());
        reporter.transport().fail(TransportError::Timeout);
        let outcome = reporter
            .report(&reading(), &identity(), ConnectionState::Connected)
            .await;
        assert!(matches!(
            outcome,
            ReportOutcome::Failed(TransportError::Timeout)
        ));
        assert_eq!(reporter.transport().sent().len(), 1);
    }
}
