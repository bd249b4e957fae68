/// Nanoseconds on `CLOCK_MONOTONIC`.
///
/// The clock is system-wide, so timestamps taken in one process compare
/// meaningfully against timestamps taken in another.
pub fn monotonic_nanos() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // CLOCK_MONOTONIC cannot fail with a valid pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn never_goes_backwards() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
