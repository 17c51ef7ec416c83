// ecowitt_relay - Prometheus metrics relay for Ecowitt weather stations
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TICK: Duration = Duration::from_secs(1);

/// When the process should be restarted by exiting and letting a supervisor start it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Run until shut down.
    Never,
    /// Exit once after the duration, whether or not reports are arriving.
    Fixed(Duration),
    /// Exit when no reports have arrived for longer than the duration. A relay that
    /// hasn't received any report yet is left running.
    Inactivity(Duration),
}

impl RestartPolicy {
    /// Inactivity based policy for a TTL, or `Never` if the TTL is zero.
    pub fn inactivity(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Self::Never
        } else {
            Self::Inactivity(ttl)
        }
    }

    /// Fixed policy for a TTL, or `Never` if the TTL is zero.
    pub fn fixed(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Self::Never
        } else {
            Self::Fixed(ttl)
        }
    }
}

/// Count of reports accepted, shared between request handlers and the watchdog.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    reports: Arc<AtomicU64>,
}

impl Activity {
    pub fn record(&self) {
        self.reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Expired,
    Cancelled,
}

#[derive(Debug)]
struct InactivityState {
    ttl: Duration,
    last_count: u64,
    last_increment: Instant,
}

impl InactivityState {
    fn new(ttl: Duration, count: u64, now: Instant) -> Self {
        InactivityState {
            ttl,
            last_count: count,
            last_increment: now,
        }
    }

    /// Record the current count, returning true if it hasn't changed for longer than the TTL.
    ///
    /// Never true before the first report.
    fn check(&mut self, count: u64, now: Instant) -> bool {
        if count == 0 {
            false
        } else if count != self.last_count {
            self.last_count = count;
            self.last_increment = now;
            false
        } else {
            now.duration_since(self.last_increment) > self.ttl
        }
    }
}

#[derive(Debug)]
pub struct Watchdog {
    policy: RestartPolicy,
    activity: Activity,
}

impl Watchdog {
    pub fn new(policy: RestartPolicy, activity: Activity) -> Self {
        Watchdog { policy, activity }
    }

    /// Run until the restart policy triggers or `shutdown` resolves.
    ///
    /// Exiting the process is left to the caller when this returns `Outcome::Expired`.
    pub async fn run<F>(self, shutdown: F) -> Outcome
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        match self.policy {
            RestartPolicy::Never => {
                shutdown.await;
                Outcome::Cancelled
            }
            RestartPolicy::Fixed(ttl) => {
                tokio::select! {
                    _ = tokio::time::sleep(ttl) => Outcome::Expired,
                    _ = &mut shutdown => Outcome::Cancelled,
                }
            }
            RestartPolicy::Inactivity(ttl) => {
                let mut state = InactivityState::new(ttl, self.activity.count(), Instant::now());
                let mut interval = tokio::time::interval(TICK);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let count = self.activity.count();
                            if state.check(count, Instant::now()) {
                                tracing::debug!(message = "no reports within ttl", reports = count, ttl_secs = ttl.as_secs());
                                return Outcome::Expired;
                            }
                        }
                        _ = &mut shutdown => {
                            return Outcome::Cancelled;
                        }
                    }
                }
            }
        }
    }
}
