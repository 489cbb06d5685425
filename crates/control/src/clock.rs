use time::OffsetDateTime;

/// Wall-clock source for session timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Clock that follows tokio's (possibly paused) timer, so tests using
/// `start_paused` see timestamps move exactly as far as their sleeps.
#[cfg(test)]
pub struct TokioClock {
    base_ms: i64,
    origin: tokio::time::Instant,
}

#[cfg(test)]
impl TokioClock {
    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            base_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}
