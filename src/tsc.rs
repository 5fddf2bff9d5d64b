//! TSC time base for link emulation and busy-wait pacing.

use std::time::{Duration, Instant};

/// Read the time-stamp counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic-nanosecond stand-in on targets without a TSC.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn rdtsc() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Estimate the TSC rate in ticks per second.
///
/// Runs three bracketed sleeps and keeps the measurement with the tightest
/// read-clock-read window. Expects a constant TSC rate locked across CPUs.
pub fn calibrate_tsc() -> u64 {
    let mut best_window = u64::MAX;
    let mut ticks_per_second = 1_000_000_000u64;

    for _ in 0..3 {
        let ta_0 = rdtsc();
        let a = Instant::now();
        let ta_1 = rdtsc();
        std::thread::sleep(Duration::from_millis(20));
        let tb_0 = rdtsc();
        let b = Instant::now();
        let tb_1 = rdtsc();

        let window = (ta_1 - ta_0) + (tb_1 - tb_0);
        if window < best_window {
            best_window = window;
            let elapsed_ns = b.duration_since(a).as_nanos() as f64;
            ticks_per_second = ((tb_0 - ta_1) as f64 * 1e9 / elapsed_ns) as u64;
        }
    }

    ticks_per_second.max(1)
}

/// Busy-wait until the TSC reaches `when`.
#[inline]
pub fn sleep_till(when: u64) {
    while rdtsc() < when {
        std::hint::spin_loop();
    }
}

/// Convert a duration in nanoseconds to TSC ticks.
#[inline]
pub fn ns_to_tsc(ticks_per_second: u64, ns: u64) -> u64 {
    (ns as f64 / 1e9 * ticks_per_second as f64) as u64
}

/// Ticks consumed per byte on a link of `bw` bits per second.
#[inline]
pub fn tsc_per_byte(ticks_per_second: u64, bw: f64) -> f64 {
    8.0 * ticks_per_second as f64 / bw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_calibrate_nonzero() {
        let tps = calibrate_tsc();
        assert!(tps > 0);
    }

    #[test]
    fn test_sleep_till_elapses() {
        let tps = calibrate_tsc();
        let start = rdtsc();
        sleep_till(start + ns_to_tsc(tps, 100_000));
        assert!(rdtsc() >= start + ns_to_tsc(tps, 100_000));
    }

    #[test]
    fn test_tsc_per_byte() {
        // 1 Gb/s at 1 GHz: 8 ticks per byte.
        let factor = tsc_per_byte(1_000_000_000, 1e9);
        assert!((factor - 8.0).abs() < 1e-9);
    }
}
