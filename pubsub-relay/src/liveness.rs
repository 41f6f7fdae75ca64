//! Per-connection liveness timer.
//!
//! The broker pings every `base` and evicts a connection once `base + margin`
//! passes without qualifying activity. Re-arming is a reset of one owned
//! [`Sleep`], so there is never more than one pending eviction per connection.
//!
//! A probe must go out early enough to be answered before the deadline. When
//! the margin is shorter than half the base (capped at one second) the probe
//! interval shrinks so that each probe still leaves that much time for the
//! pong.

use std::{future::pending, pin::Pin, time::Duration};

use tokio::{
    select,
    time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep_until},
};

/// Upper bound on the time kept between a probe and the deadline it guards.
const MAX_PROBE_LEAD: Duration = Duration::from_secs(1);

/// Time a probe needs before the deadline: half the base, at most one second.
fn probe_lead(base: Duration) -> Duration {
    (base / 2).min(MAX_PROBE_LEAD)
}

/// Every `base`, or sooner when `margin` leaves less than [`probe_lead`].
fn probe_interval(base: Duration, margin: Duration) -> Duration {
    let timeout = base + margin;
    base.min(timeout.saturating_sub(probe_lead(base)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Connection not classified yet; nothing scheduled.
    Idle,
    /// Deadline scheduled and no probe outstanding. Qualifying activity
    /// returns here, re-arming the deadline.
    Armed,
    /// A probe was sent and not answered yet; the deadline stands.
    Probed,
    /// Deadline passed. Terminal.
    Expired,
    /// Connection closed for another reason. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Time to send the next probe.
    ProbeDue,
    /// Deadline passed; the connection must be evicted.
    Expired,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    state: LivenessState,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    probes: Interval,
}

impl LivenessMonitor {
    /// `base` must be non-zero.
    pub fn new(base: Duration, margin: Duration) -> Self {
        let timeout = base + margin;
        let every = probe_interval(base, margin).max(Duration::from_millis(1));
        let now = Instant::now();
        let mut probes = interval_at(now + every, every);
        probes.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            state: LivenessState::Idle,
            timeout,
            deadline: Box::pin(sleep_until(now + timeout)),
            probes,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(test)]
    fn deadline(&self) -> Instant {
        self.deadline.deadline()
    }

    fn is_active(&self) -> bool {
        matches!(self.state, LivenessState::Armed | LivenessState::Probed)
    }

    /// Schedules the first eviction. Only meaningful from `Idle`.
    pub fn arm(&mut self) {
        if self.state != LivenessState::Idle {
            return;
        }
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
        self.probes.reset();
        self.state = LivenessState::Armed;
    }

    /// Qualifying activity: push the deadline to `now + base + margin`.
    pub fn record_activity(&mut self) {
        if !self.is_active() {
            return;
        }
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
        self.state = LivenessState::Armed;
    }

    /// A probe went out; the deadline stays where it is until the peer answers.
    pub fn probe_sent(&mut self) {
        if self.is_active() {
            self.state = LivenessState::Probed;
        }
    }

    pub fn close(&mut self) {
        if self.state != LivenessState::Expired {
            self.state = LivenessState::Closed;
        }
    }

    /// Waits for the next probe or the eviction deadline, whichever is first.
    /// Never resolves outside `Armed`/`Probed`, so `Expired` is reported once.
    pub async fn tick(&mut self) -> LivenessEvent {
        if !self.is_active() {
            return pending().await;
        }

        select! {
            biased;
            () = &mut self.deadline => {
                self.state = LivenessState::Expired;
                LivenessEvent::Expired
            }
            _ = self.probes.tick() => LivenessEvent::ProbeDue,
        }
    }
}
