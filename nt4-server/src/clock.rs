use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Microsecond monotonic clock plus the server-time offset.
///
/// On a server the offset stays 0 and `server_time` is the raw monotonic
/// clock; only the client half of an RTT exchange mutates it.
pub struct Clock {
    origin: Instant,
    offset_micros: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
            offset_micros: AtomicI64::new(0),
        }
    }

    /// Microseconds since this clock was created.
    pub fn monotonic_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    pub fn offset(&self) -> i64 {
        self.offset_micros.load(Ordering::SeqCst)
    }

    pub fn set_offset(&self, offset: i64) {
        self.offset_micros.store(offset, Ordering::SeqCst);
    }

    /// `monotonic + offset`, saturating at zero.
    pub fn server_time(&self) -> u64 {
        let now = self.monotonic_micros();
        let offset = self.offset();
        if offset >= 0 {
            now.saturating_add(offset as u64)
        } else {
            now.saturating_sub(offset.unsigned_abs())
        }
    }

    /// Applies an RTT response received at monotonic time `now`.
    pub fn apply_rtt(&self, response_timestamp: u64, echoed_client_time: u64, now: u64) {
        self.set_offset(compute_offset(response_timestamp, echoed_client_time, now));
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

/// The offset a client derives from one RTT exchange: the echoed send time
/// yields the round trip, half of which is added to the server's response
/// timestamp to estimate current server time.
pub fn compute_offset(response_timestamp: u64, echoed_client_time: u64, now: u64) -> i64 {
    let rtt = now.saturating_sub(echoed_client_time);
    let estimated_server = response_timestamp + rtt / 2;
    estimated_server as i64 - now as i64
}
