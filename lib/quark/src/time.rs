use std::sync::Mutex;
use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp in microseconds.
#[inline]
pub fn timestamp_usec() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_micros() as i64
}

struct Offset {
    /// Offset the adjusted clock is converging towards.
    target: i64,
    /// Local time at which `value` was snapshotted.
    value_time: i64,
    /// Offset value at the start of the current interpolation.
    value: i64,
}

/// Smoothed clock offset against a remote reference clock.
///
/// The adjusted time never jumps: between updates the offset moves linearly
/// from its last snapshot towards the target, at a rate bounded by
/// `max_slope` (microseconds of offset per microsecond of real time). The
/// offset state is shared between the fibre feeding updates and the fibre
/// reading the clock, so it sits behind a mutex; the critical section is a
/// few integer operations.
pub struct TimeSync {
    offset: Mutex<Offset>,
    max_slope: f64,
}

impl TimeSync {
    pub const DEFAULT_MAX_SLOPE: f64 = 0.5;

    pub fn new(max_slope: f64) -> TimeSync {
        TimeSync {
            offset: Mutex::new(Offset {
                target: 0,
                value_time: timestamp_usec(),
                value: 0,
            }),
            max_slope,
        }
    }

    /// Monotonic-enough local wall clock in microseconds.
    #[inline]
    pub fn hardware_time_usec(&self) -> i64 {
        timestamp_usec()
    }

    /// Local time adjusted by the smoothed offset.
    #[inline]
    pub fn time_usec(&self) -> i64 {
        self.hardware_time_usec() + self.adjusted_offset()
    }

    /// The slope-limited offset at the present instant.
    pub fn adjusted_offset(&self) -> i64 {
        let offset = self.offset.lock().expect("Time sync lock poisoned");

        let delta = offset.target - offset.value;
        let slope_time = (delta.abs() as f64 / self.max_slope) as i64;
        let t = self.hardware_time_usec() - offset.value_time;

        if t >= slope_time {
            offset.target
        } else {
            // i128 keeps the interpolation exact for arbitrarily large
            // offset deltas.
            offset.value + (delta as i128 * t as i128 / slope_time as i128) as i64
        }
    }

    /// Records a new remote reference time. The current smoothed offset is
    /// snapshotted as the start of the next interpolation, so the adjusted
    /// clock stays continuous.
    pub fn update_time(&self, remote_usec: i64) {
        let value = self.adjusted_offset();
        let local = self.hardware_time_usec();

        let mut offset = self.offset.lock().expect("Time sync lock poisoned");
        offset.value = value;
        offset.value_time = local;
        offset.target = remote_usec - local;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_offset_without_updates() {
        let ts = TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE);
        assert_eq!(ts.adjusted_offset(), 0);

        let hw = ts.hardware_time_usec();
        let adjusted = ts.time_usec();
        assert!((adjusted - hw).abs() < 1000);
    }

    #[test]
    fn test_offset_converges_to_target() {
        let ts = TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE);

        // 2ms ahead of local: full convergence needs 4ms of real time.
        ts.update_time(ts.hardware_time_usec() + 2_000);

        let early = ts.adjusted_offset();
        assert!(early < 2_000);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ts.adjusted_offset(), 2_000);
    }

    #[test]
    fn test_offset_is_bounded_by_slope() {
        let ts = TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE);
        ts.update_time(ts.hardware_time_usec() + 1_000_000);

        thread::sleep(Duration::from_millis(10));

        // After ~10ms at slope 0.5 the offset can have moved ~5ms at most.
        // Allow generous scheduling slack.
        let offset = ts.adjusted_offset();
        assert!(offset < 200_000, "offset moved too fast: {}", offset);
    }

    #[test]
    fn test_adjusted_time_is_monotonic() {
        let ts = TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE);

        // Drive the target backwards; the adjusted clock must still advance.
        ts.update_time(ts.hardware_time_usec() - 500_000);

        let mut last = ts.time_usec();
        for _ in 0..50 {
            thread::sleep(Duration::from_micros(200));
            let now = ts.time_usec();
            assert!(now >= last, "clock went backwards: {} < {}", now, last);
            last = now;
        }
    }

    #[test]
    fn test_update_snapshots_current_value() {
        let ts = TimeSync::new(TimeSync::DEFAULT_MAX_SLOPE);
        ts.update_time(ts.hardware_time_usec() + 1_000_000);

        thread::sleep(Duration::from_millis(5));

        // Re-target to zero mid-slope: offset must not jump back to zero.
        let before = ts.adjusted_offset();
        ts.update_time(ts.hardware_time_usec());
        let after = ts.adjusted_offset();

        assert!((after - before).abs() < 100_000);
    }
}
