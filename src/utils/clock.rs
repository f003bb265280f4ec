use chrono::{Local, NaiveDateTime};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time for the stream client and stages.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn wall(&self) -> NaiveDateTime;

    fn wall_millis(&self) -> i64 {
        self.wall().and_utc().timestamp_millis()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock that only moves when told to. Both readings advance together.
pub struct ManualClock {
    origin: Instant,
    wall_origin: NaiveDateTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(wall_origin: NaiveDateTime) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn wall(&self) -> NaiveDateTime {
        // chrono::Duration::from_std only fails past ~292 billion years
        let offset = chrono::Duration::from_std(self.offset()).unwrap_or(chrono::Duration::zero());
        self.wall_origin + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn manual_clock_moves_both_readings() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        let t0 = clock.now();

        clock.advance_ms(2500);

        assert_eq!(clock.now().duration_since(t0), Duration::from_millis(2500));
        assert_eq!(clock.wall(), start + chrono::Duration::milliseconds(2500));
    }
}
