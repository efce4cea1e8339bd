//! Named deadlines for the control worker.
//!
//! All protocol timers live in one [`Deadlines`] value owned by the worker
//! task, which awaits [`Deadlines::next`] as one branch of its
//! `tokio::select!`. Arming a deadline replaces any earlier arming of the
//! same name, so a stale timer can never fire.

use std::time::Duration;

use tokio::time::Instant;

/// The control stream's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// One-shot: resend the auth packet with magic 0x05.
    SecondAuth,
    /// One-shot: the stream grant did not arrive in time.
    RequestTimeout,
    /// Periodic: refresh authentication.
    Reauth,
    /// Periodic: log uptime and latency.
    StatusLog,
}

impl Deadline {
    const ALL: [Deadline; 4] = [
        Deadline::SecondAuth,
        Deadline::RequestTimeout,
        Deadline::Reauth,
        Deadline::StatusLog,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    at: Instant,
    period: Option<Duration>,
}

/// A set of cancellable, named timers.
#[derive(Debug, Default)]
pub struct Deadlines {
    slots: [Option<Armed>; 4],
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `deadline` once, `after` from now.
    pub fn arm_once(&mut self, deadline: Deadline, after: Duration) {
        self.slots[deadline.index()] = Some(Armed {
            at: Instant::now() + after,
            period: None,
        });
    }

    /// Fire `deadline` every `period`, starting one period from now.
    pub fn arm_periodic(&mut self, deadline: Deadline, period: Duration) {
        self.slots[deadline.index()] = Some(Armed {
            at: Instant::now() + period,
            period: Some(period),
        });
    }

    pub fn cancel(&mut self, deadline: Deadline) {
        self.slots[deadline.index()] = None;
    }

    pub fn cancel_all(&mut self) {
        self.slots = [None; 4];
    }

    pub fn is_armed(&self, deadline: Deadline) -> bool {
        self.slots[deadline.index()].is_some()
    }

    /// The next deadline to fire. Ties go to the earlier variant.
    fn earliest(&self) -> Option<(Deadline, Instant)> {
        Deadline::ALL
            .iter()
            .filter_map(|&d| self.slots[d.index()].map(|armed| (d, armed.at)))
            .min_by_key(|&(_, at)| at)
    }

    /// Wait for the next deadline and return its name.
    ///
    /// One-shot deadlines are disarmed and periodic ones rescheduled when
    /// they fire. Pends forever while nothing is armed. Cancel-safe: the
    /// set is only modified after the sleep completes.
    pub async fn next(&mut self) -> Deadline {
        let Some((deadline, at)) = self.earliest() else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(at).await;

        if let Some(armed) = &mut self.slots[deadline.index()] {
            if let Some(period) = armed.period {
                let now = Instant::now();
                armed.at += period;
                // Skip missed periods rather than firing in a burst.
                if armed.at <= now {
                    armed.at = now + period;
                }
                return deadline;
            }
        }
        self.slots[deadline.index()] = None;
        deadline
    }
}
