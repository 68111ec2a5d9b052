//! Keyspace planner (§4.3): a pure, deterministic function from a job's
//! total keyspace and a benchmarked rate to a sequence of disjoint
//! half-open task ranges.
//!
//! Deliberately takes no database handle and does no I/O, so a crashed
//! scheduler restart re-plans identical ranges given the same inputs, and
//! so it is unit-testable without a pool.

use std::ops::Range;
use std::time::Duration;

use kh_db::devices::DeviceKind;

/// Conservative per-device-kind throughput estimate used when no
/// `benchmark_result` has been observed yet for a job's hash type (§4.3).
/// Deliberately pessimistic: a task sized against an optimistic guess
/// that turns out wrong runs far longer than `chunk_target`, while one
/// sized against a pessimistic guess just gets replanned sooner once a
/// real benchmark arrives.
pub fn conservative_default_rate(kind: DeviceKind) -> u64 {
    match kind {
        DeviceKind::Cpu => 10_000,
        DeviceKind::GpuIntel => 500_000,
        DeviceKind::GpuAmd => 2_000_000,
        DeviceKind::GpuNvidia => 5_000_000,
    }
}

/// Split `[0, total_keyspace)` into disjoint half-open ranges sized to
/// take about `chunk_target` wall-clock time at `slowest_rate_hashes_per_sec`,
/// clamped to `[min_chunk, max_chunk]` of that same rate (§4.3).
pub fn plan(
    total_keyspace: u64,
    slowest_rate_hashes_per_sec: u64,
    chunk_target: Duration,
    min_chunk: Duration,
    max_chunk: Duration,
) -> Vec<Range<u64>> {
    if total_keyspace == 0 {
        return Vec::new();
    }

    let rate = slowest_rate_hashes_per_sec.max(1) as u128;
    let target_size = rate * chunk_target.as_secs() as u128;
    let min_size = (rate * min_chunk.as_secs() as u128).max(1);
    let max_size = (rate * max_chunk.as_secs() as u128).max(min_size);
    let chunk_size = target_size.clamp(min_size, max_size).max(1) as u64;

    let mut ranges = Vec::new();
    let mut start = 0u64;
    while start < total_keyspace {
        let end = start.saturating_add(chunk_size).min(total_keyspace);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_the_whole_keyspace_with_disjoint_ranges() {
        let ranges = plan(1_000_000, 10_000, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600));
        let mut cursor = 0u64;
        for r in &ranges {
            assert_eq!(r.start, cursor);
            assert!(r.end > r.start);
            cursor = r.end;
        }
        assert_eq!(cursor, 1_000_000);
    }

    #[test]
    fn is_deterministic_given_the_same_inputs() {
        let a = plan(7_777_777, 123_456, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600));
        let b = plan(7_777_777, 123_456, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600));
        assert_eq!(a, b);
    }

    #[test]
    fn chunk_size_never_exceeds_max_chunk_at_the_given_rate() {
        let ranges = plan(u64::MAX / 2, 1_000_000_000, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600));
        let max_size = 1_000_000_000u64 * 3_600;
        for r in &ranges {
            assert!(r.end - r.start <= max_size);
        }
    }

    #[test]
    fn tiny_keyspace_still_produces_a_single_range() {
        let ranges = plan(5, 10_000, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600));
        assert_eq!(ranges, vec![0..5]);
    }

    #[test]
    fn zero_keyspace_produces_no_ranges() {
        assert!(plan(0, 10_000, Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(3_600)).is_empty());
    }
}
