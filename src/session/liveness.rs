use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// no transport connection to monitor
    Disarmed,
    Alive,
    TimedOut,
}

/// Decides whether the current transport connection is dead based on elapsed time since the
///  peer was last heard from. Armed only after a handshake completed, so a connection is never
///  torn down mid-handshake.
pub struct LivenessMonitor {
    timeout: Duration,
    last_seen: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> LivenessMonitor {
        LivenessMonitor {
            timeout,
            last_seen: None,
        }
    }

    pub fn arm(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    pub fn disarm(&mut self) {
        self.last_seen = None;
    }

    pub fn touch(&mut self) {
        if self.last_seen.is_some() {
            self.last_seen = Some(Instant::now());
        }
    }

    pub fn check(&self) -> Liveness {
        match self.last_seen {
            None => Liveness::Disarmed,
            Some(last_seen) if last_seen.elapsed() < self.timeout => Liveness::Alive,
            Some(_) => Liveness::TimedOut,
        }
    }
}
