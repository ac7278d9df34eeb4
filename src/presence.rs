//! # Presence Inference
//!
//! Derives "who is talking" from the decoded event stream.
//!
//! ## Two independent flags:
//! - **listening**: set and cleared only by the caller (`startListening`/`stopListening`)
//! - **speaking**: set immediately by any speaking trigger (output audio started, an
//!   audio delta, an audio-bearing history item); cleared by a silence timer
//!
//! ## Debounce:
//! Every trigger re-arms a single timer of `debounce` length. Speaking ends only when
//! the timer fires with no newer trigger, so a burst of deltas reads as one interval.
//! While the playback pipeline reports active output the timer cannot clear speaking;
//! it is re-armed when output stops.
//!
//! Changes are pushed through a `watch` channel and an observer list; nothing polls.

use crate::dispatcher::ObserverList;
use crate::protocol::RealtimeEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Idle,
    Listening,
    Speaking,
}

/// Composite presence: both flags may be true at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Presence {
    pub listening: bool,
    pub speaking: bool,
}

impl Presence {
    /// Collapse to a single state; remote speech wins over local capture.
    pub fn state(&self) -> PresenceState {
        if self.speaking {
            PresenceState::Speaking
        } else if self.listening {
            PresenceState::Listening
        } else {
            PresenceState::Idle
        }
    }
}

#[derive(Default)]
struct Machine {
    presence: Presence,
    output_active: bool,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

struct TrackerInner {
    debounce: Duration,
    machine: Mutex<Machine>,
    signal: watch::Sender<Presence>,
    observers: ObserverList<Presence>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    pub fn new(debounce: Duration) -> Self {
        let (signal, _) = watch::channel(Presence::default());
        Self {
            inner: Arc::new(TrackerInner {
                debounce,
                machine: Mutex::new(Machine::default()),
                signal,
                observers: ObserverList::default(),
            }),
        }
    }

    pub fn current(&self) -> Presence {
        *self.inner.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Presence> {
        self.inner.signal.subscribe()
    }

    pub fn on_change<F>(&self, observer: F)
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.inner.observers.add(observer);
    }

    pub fn set_listening(&self, listening: bool) {
        self.update(|machine| machine.presence.listening = listening);
    }

    /// Feed one decoded inbound event.
    pub fn observe(&self, event: &RealtimeEvent) {
        if event.is_speaking_trigger() {
            self.update(|machine| {
                machine.presence.speaking = true;
                self.arm_timer(machine);
            });
        } else if *event == RealtimeEvent::AudioStopped {
            // The service says output ended; let the silence window run out
            self.update(|machine| {
                if machine.presence.speaking {
                    self.arm_timer(machine);
                }
            });
        }
    }

    /// Playback activity from the output pipeline.
    pub fn set_output_active(&self, active: bool) {
        self.update(|machine| {
            machine.output_active = active;
            if active {
                machine.presence.speaking = true;
                cancel_timer(machine);
            } else if machine.presence.speaking {
                self.arm_timer(machine);
            }
        });
    }

    /// Back to Idle: both flags cleared, timer cancelled.
    pub fn reset(&self) {
        self.update(|machine| {
            cancel_timer(machine);
            machine.output_active = false;
            machine.presence = Presence::default();
        });
    }

    fn arm_timer(&self, machine: &mut Machine) {
        cancel_timer(machine);
        let generation = machine.timer_generation;
        let tracker = self.clone();
        let debounce = self.inner.debounce;
        machine.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            tracker.silence_elapsed(generation);
        }));
    }

    fn silence_elapsed(&self, generation: u64) {
        self.update(|machine| {
            if machine.timer_generation != generation || machine.output_active {
                return;
            }
            machine.timer = None;
            machine.presence.speaking = false;
        });
    }

    /// Apply a mutation and publish if the visible presence changed.
    fn update(&self, mutate: impl FnOnce(&mut Machine)) {
        let changed = {
            let mut machine = self.inner.machine.lock();
            let before = machine.presence;
            mutate(&mut *machine);
            let after = machine.presence;
            if before == after {
                None
            } else {
                self.inner.signal.send_replace(after);
                Some(after)
            }
        };
        if let Some(presence) = changed {
            debug!(state = ?presence.state(), listening = presence.listening, speaking = presence.speaking, "Presence changed");
            self.inner.observers.notify(&presence);
        }
    }
}

fn cancel_timer(machine: &mut Machine) {
    machine.timer_generation += 1;
    if let Some(timer) = machine.timer.take() {
        timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    const WINDOW: Duration = Duration::from_millis(150);

    fn recording(tracker: &PresenceTracker) -> Arc<Mutex<Vec<(Instant, Presence)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        tracker.on_change(move |p| sink.lock().push((Instant::now(), *p)));
        log
    }

    fn chunk() -> RealtimeEvent {
        RealtimeEvent::AudioChunk("AAAA".to_string())
    }

    #[test]
    fn test_state_collapse() {
        let both = Presence { listening: true, speaking: true };
        assert_eq!(both.state(), PresenceState::Speaking);
        let listening = Presence { listening: true, speaking: false };
        assert_eq!(listening.state(), PresenceState::Listening);
        assert_eq!(Presence::default().state(), PresenceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_immediate() {
        let tracker = PresenceTracker::new(WINDOW);
        tracker.observe(&RealtimeEvent::AudioStarted);
        assert_eq!(tracker.current().state(), PresenceState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_one_speaking_interval() {
        let tracker = PresenceTracker::new(WINDOW);
        let log = recording(&tracker);

        for _ in 0..10 {
            tracker.observe(&chunk());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let last_trigger = Instant::now() - Duration::from_millis(100);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let log = log.lock();
        assert_eq!(log.len(), 2, "expected exactly one on and one off edge: {:?}", *log);
        assert!(log[0].1.speaking);
        assert!(!log[1].1.speaking);
        let quiet_for = log[1].0 - last_trigger;
        assert!(quiet_for >= WINDOW && quiet_for < WINDOW + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_is_independent_of_speaking() {
        let tracker = PresenceTracker::new(WINDOW);
        tracker.set_listening(true);
        tracker.observe(&RealtimeEvent::HistoryAudioItem);
        assert_eq!(tracker.current(), Presence { listening: true, speaking: true });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.current(), Presence { listening: true, speaking: false });
        assert_eq!(tracker.current().state(), PresenceState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_output_holds_speaking() {
        let tracker = PresenceTracker::new(WINDOW);
        tracker.observe(&chunk());
        tracker.set_output_active(true);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.current().speaking);

        tracker.set_output_active(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tracker.current().speaking);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!tracker.current().speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_timer() {
        let tracker = PresenceTracker::new(WINDOW);
        let log = recording(&tracker);
        tracker.set_listening(true);
        tracker.observe(&chunk());

        tracker.reset();
        assert_eq!(tracker.current().state(), PresenceState::Idle);
        tokio::time::sleep(Duration::from_secs(1)).await;
        // listening on, speaking on, reset: no late timer edge
        assert_eq!(log.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_trigger_events_are_ignored() {
        let tracker = PresenceTracker::new(WINDOW);
        tracker.observe(&RealtimeEvent::TranscriptDelta("hi".into()));
        tracker.observe(&RealtimeEvent::AudioStopped);
        assert_eq!(tracker.current(), Presence::default());
    }
}
