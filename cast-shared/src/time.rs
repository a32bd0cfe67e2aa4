use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset in seconds between the NTP epoch (1900) and the unix epoch (1970).
pub const NTP_UNIX_EPOCH_OFFSET_SECS: u64 = 0x83AA7E80;

/// Pins a monotonic [`Instant`] to wall-clock time so that local instants can
/// be converted to and from NTP timestamps carried in RTCP.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    /// Anchors `instant` at `duration_since_unix_epoch`, for deterministic clocks.
    pub fn new(instant: Instant, duration_since_unix_epoch: Duration) -> Self {
        Self {
            instant,
            duration_since_unix_epoch,
        }
    }

    pub fn instant(&self, duration_since_unix_epoch: Duration) -> Instant {
        if duration_since_unix_epoch >= self.duration_since_unix_epoch {
            self.instant + (duration_since_unix_epoch - self.duration_since_unix_epoch)
        } else {
            let before = self.duration_since_unix_epoch - duration_since_unix_epoch;
            self.instant.checked_sub(before).unwrap_or(self.instant)
        }
    }

    pub fn duration_since_unix_epoch(&self) -> Duration {
        self.duration_since_unix_epoch
    }

    pub fn unix(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.instant)
            .add(self.duration_since_unix_epoch)
    }

    pub fn ntp(&self, now: Instant) -> u64 {
        SystemInstant::unix2ntp(self.unix(now))
    }

    /// Maps a 64-bit NTP timestamp back onto the local monotonic clock.
    pub fn ntp_to_instant(&self, ntp: u64) -> Instant {
        self.instant(SystemInstant::ntp2unix(ntp))
    }

    pub fn unix2ntp(duration_since_unix_epoch: Duration) -> u64 {
        let u = duration_since_unix_epoch.as_nanos() as u64;

        let mut s = u / 1_000_000_000;
        s += NTP_UNIX_EPOCH_OFFSET_SECS;
        let mut f = u % 1_000_000_000;
        f <<= 32;
        f /= 1_000_000_000;
        s <<= 32;

        s | f
    }

    pub fn ntp2unix(ntp: u64) -> Duration {
        let s = (ntp >> 32).saturating_sub(NTP_UNIX_EPOCH_OFFSET_SECS);
        let mut f = ntp & 0xFFFFFFFF;
        f *= 1_000_000_000;
        f >>= 32;

        Duration::new(s, f as u32)
    }
}

/// Splits a 64-bit NTP timestamp into its seconds and fraction words.
pub fn ntp_split(ntp: u64) -> (u32, u32) {
    ((ntp >> 32) as u32, ntp as u32)
}

pub fn ntp_join(ntp_seconds: u32, ntp_fraction: u32) -> u64 {
    ((ntp_seconds as u64) << 32) | ntp_fraction as u64
}

/// Middle 32 bits of an NTP timestamp, as carried in the LSR field of a
/// report block.
pub fn compact_ntp(ntp_seconds: u32, ntp_fraction: u32) -> u32 {
    ((ntp_seconds & 0x0000ffff) << 16) | ((ntp_fraction & 0xffff0000) >> 16)
}

/// Converts a compact NTP duration (16.16 fixed point seconds, as in DLSR)
/// to a [`Duration`] with millisecond precision.
pub fn compact_ntp_to_duration(ntp_delay: u32) -> Duration {
    let mut delay_ms = ((ntp_delay & 0x0000ffff) as u64 * 1000) >> 16;
    delay_ms += ((ntp_delay & 0xffff0000) >> 16) as u64 * 1000;
    Duration::from_millis(delay_ms)
}

/// Converts a [`Duration`] to the 16.16 fixed point compact NTP form.
pub fn duration_to_compact_ntp(delay: Duration) -> u32 {
    let seconds = delay.as_secs().min(0xffff) as u32;
    let fraction = ((delay.subsec_nanos() as u64) << 16) / 1_000_000_000;
    (seconds << 16) | fraction as u32
}

/// Signed difference `a - b` in microseconds.
pub fn signed_micros(a: Duration, b: Duration) -> i64 {
    if a >= b {
        (a - b).as_micros() as i64
    } else {
        -((b - a).as_micros() as i64)
    }
}

/// Shifts `instant` by a signed number of microseconds, saturating at the
/// earliest representable instant.
pub fn offset_instant(instant: Instant, micros: i64) -> Instant {
    let magnitude = Duration::from_micros(micros.unsigned_abs());
    if micros >= 0 {
        instant + magnitude
    } else {
        instant.checked_sub(magnitude).unwrap_or(instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_unix_conversion() {
        let unix = Duration::new(1_700_000_000, 500_000_000);
        let ntp = SystemInstant::unix2ntp(unix);
        let (seconds, fraction) = ntp_split(ntp);
        assert_eq!(seconds as u64, 1_700_000_000 + NTP_UNIX_EPOCH_OFFSET_SECS);
        assert_eq!(fraction, 1 << 31);

        let back = SystemInstant::ntp2unix(ntp_join(seconds, fraction));
        assert_eq!(back.as_millis(), unix.as_millis());
    }

    #[test]
    fn test_ntp_before_unix_epoch_saturates() {
        assert_eq!(SystemInstant::ntp2unix(0), Duration::ZERO);
    }

    #[test]
    fn test_system_instant_ntp_roundtrip() {
        let base = Instant::now();
        let clock = SystemInstant::new(base, Duration::from_secs(1_600_000_000));
        let later = base + Duration::from_millis(1234);
        let ntp = clock.ntp(later);
        let local = clock.ntp_to_instant(ntp);
        let error = if local > later {
            local - later
        } else {
            later - local
        };
        assert!(error < Duration::from_micros(1));
    }

    #[test]
    fn test_compact_ntp() {
        assert_eq!(compact_ntp(0x12345678, 0x9abcdef0), 0x56789abc);
        assert_eq!(
            compact_ntp_to_duration(0x0001_8000),
            Duration::from_millis(1500)
        );
        assert_eq!(
            duration_to_compact_ntp(Duration::from_millis(1500)),
            0x0001_8000
        );
    }

    #[test]
    fn test_signed_micros() {
        let a = Duration::from_millis(10);
        let b = Duration::from_millis(25);
        assert_eq!(signed_micros(a, b), -15_000);
        assert_eq!(signed_micros(b, a), 15_000);

        let now = Instant::now() + Duration::from_secs(1);
        assert_eq!(offset_instant(now, -1000) + Duration::from_millis(1), now);
    }
}
