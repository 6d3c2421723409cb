//! Firmware update participation in the control loop.
//!
//! Only the scheduling slot is modelled here.  An [`UpdateSource`] reports
//! lifecycle events; [`UpdateAgent`] turns them into explicit state
//! transitions and publishes each one to its observers.
//!
//! ```text
//! Idle ──Started──▶ Receiving{progress,total} ──Finished──▶ Completed
//!                        │  ▲                                   │
//!                        │  └──Progress──┘                      │
//!                        └──Error(e)──▶ Failed(e) ──Started──┐  │
//!                                                            ▼  ▼
//!                                                        Receiving
//! ```

use thiserror::Error;

/// Failure classes reported by the update transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("authentication failed")]
    Auth,
    #[error("begin failed")]
    Begin,
    #[error("connect failed")]
    Connect,
    #[error("receive failed")]
    Receive,
    #[error("end failed")]
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Started,
    Progress { progress: u64, total: u64 },
    Finished,
    Error(UpdateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Receiving { progress: u64, total: u64 },
    Completed,
    Failed(UpdateError),
}

impl UpdateState {
    pub fn is_receiving(&self) -> bool {
        matches!(self, Self::Receiving { .. })
    }
}

/// Where update events come from.  Polled once per scheduler iteration.
pub trait UpdateSource {
    fn poll_event(&mut self) -> Option<UpdateEvent>;
}

/// A source that never offers an update.
pub struct NoUpdates;

impl UpdateSource for NoUpdates {
    fn poll_event(&mut self) -> Option<UpdateEvent> {
        None
    }
}

pub trait UpdateObserver {
    fn on_transition(&mut self, from: UpdateState, to: UpdateState);
}

/// Logs every transition.
pub struct LoggingObserver {
    hostname: String,
}

impl LoggingObserver {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
        }
    }
}

impl UpdateObserver for LoggingObserver {
    fn on_transition(&mut self, from: UpdateState, to: UpdateState) {
        match to {
            UpdateState::Receiving { progress, total } => {
                if !from.is_receiving() {
                    tracing::info!(host = %self.hostname, "firmware update started");
                } else if total > 0 {
                    tracing::debug!(progress, total, pct = progress * 100 / total, "firmware update progress");
                }
            }
            UpdateState::Completed => {
                tracing::info!(host = %self.hostname, "firmware update complete")
            }
            UpdateState::Failed(e) => {
                tracing::error!(host = %self.hostname, "firmware update failed: {e}")
            }
            UpdateState::Idle => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct UpdateAgent<S> {
    source: S,
    state: UpdateState,
    observers: Vec<Box<dyn UpdateObserver>>,
}

impl<S: UpdateSource> UpdateAgent<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: UpdateState::Idle,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Box<dyn UpdateObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Drain pending events.  Returns true while a transfer is in progress,
    /// in which case the caller must skip its other duties.
    pub fn service(&mut self) -> bool {
        while let Some(event) = self.source.poll_event() {
            let next = transition(self.state, event);
            if next != self.state {
                let from = self.state;
                self.state = next;
                for observer in &mut self.observers {
                    observer.on_transition(from, next);
                }
            }
        }
        self.state.is_receiving()
    }
}

fn transition(state: UpdateState, event: UpdateEvent) -> UpdateState {
    use UpdateEvent as E;
    use UpdateState as S;

    match (state, event) {
        (_, E::Started) => S::Receiving {
            progress: 0,
            total: 0,
        },
        (S::Receiving { .. }, E::Progress { progress, total }) => S::Receiving { progress, total },
        (S::Receiving { .. }, E::Finished) => S::Completed,
        (S::Receiving { .. }, E::Error(e)) => S::Failed(e),
        // Events outside a transfer are stale; ignore them.
        (other, _) => other,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays scripted events, one batch per `service()` call.
    pub(crate) struct ScriptedSource {
        batches: VecDeque<Vec<UpdateEvent>>,
        current: VecDeque<UpdateEvent>,
    }

    impl ScriptedSource {
        pub(crate) fn new(batches: Vec<Vec<UpdateEvent>>) -> Self {
            let mut batches: VecDeque<_> = batches.into();
            let current = batches.pop_front().unwrap_or_default().into();
            Self { batches, current }
        }
    }

    impl UpdateSource for ScriptedSource {
        fn poll_event(&mut self) -> Option<UpdateEvent> {
            let event = self.current.pop_front();
            if event.is_none() {
                self.current = self.batches.pop_front().unwrap_or_default().into();
            }
            event
        }
    }

    struct Recorder(Rc<RefCell<Vec<(UpdateState, UpdateState)>>>);

    impl UpdateObserver for Recorder {
        fn on_transition(&mut self, from: UpdateState, to: UpdateState) {
            self.0.borrow_mut().push((from, to));
        }
    }

    fn agent(batches: Vec<Vec<UpdateEvent>>) -> UpdateAgent<ScriptedSource> {
        UpdateAgent::new(ScriptedSource::new(batches))
    }

    #[test]
    fn no_updates_stays_idle() {
        let mut a = UpdateAgent::new(NoUpdates);
        assert!(!a.service());
        assert_eq!(a.state(), UpdateState::Idle);
    }

    #[test]
    fn full_transfer_lifecycle() {
        let mut a = agent(vec![
            vec![UpdateEvent::Started],
            vec![UpdateEvent::Progress {
                progress: 512,
                total: 1024,
            }],
            vec![UpdateEvent::Finished],
        ]);

        assert!(a.service());
        assert!(a.service());
        assert_eq!(
            a.state(),
            UpdateState::Receiving {
                progress: 512,
                total: 1024
            }
        );
        assert!(!a.service());
        assert_eq!(a.state(), UpdateState::Completed);
    }

    #[test]
    fn error_fails_transfer() {
        let mut a = agent(vec![vec![
            UpdateEvent::Started,
            UpdateEvent::Error(UpdateError::Receive),
        ]]);
        assert!(!a.service());
        assert_eq!(a.state(), UpdateState::Failed(UpdateError::Receive));
    }

    #[test]
    fn stale_events_ignored_when_idle() {
        let mut a = agent(vec![vec![
            UpdateEvent::Finished,
            UpdateEvent::Progress {
                progress: 1,
                total: 2,
            },
            UpdateEvent::Error(UpdateError::Auth),
        ]]);
        assert!(!a.service());
        assert_eq!(a.state(), UpdateState::Idle);
    }

    #[test]
    fn observers_see_every_transition() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut a = agent(vec![vec![
            UpdateEvent::Started,
            UpdateEvent::Finished,
        ]]);
        a.subscribe(Box::new(Recorder(Rc::clone(&log))));
        a.subscribe(Box::new(LoggingObserver::new("SmartGarden-A4CF12B3C0DE")));
        a.service();

        let seen = log.borrow();
        assert_eq!(
            *seen,
            vec![
                (
                    UpdateState::Idle,
                    UpdateState::Receiving {
                        progress: 0,
                        total: 0
                    }
                ),
                (
                    UpdateState::Receiving {
                        progress: 0,
                        total: 0
                    },
                    UpdateState::Completed
                ),
            ]
        );
    }

    #[test]
    fn restart_after_failure() {
        assert_eq!(
            transition(UpdateState::Failed(UpdateError::End), UpdateEvent::Started),
            UpdateState::Receiving {
                progress: 0,
                total: 0
            }
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(UpdateError::Auth.to_string(), "authentication failed");
        assert_eq!(UpdateError::End.to_string(), "end failed");
    }
}
