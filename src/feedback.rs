//! Coverage feedback subsystem

use std::time::Duration;

/// Number of edge cells in the coverage map
pub const MAP_SIZE: usize = 65536;

/// Frequency class of an edge hit count.
///
/// Returns the 0-based index of the most significant set bit, -1 for
/// zero. This collapses raw hit counts into nine canonical classes so
/// that hit count noise does not register as new coverage.
#[inline]
pub fn bucket(value: u8) -> i8 {
    match value {
        0 => -1,
        _ => 7 - value.leading_zeros() as i8,
    }
}

/// Immutable snapshot of a single execution of the target
#[derive(Clone, Debug)]
pub struct Trace {
    /// Owned copy of the coverage map
    map: Vec<u8>,
    /// Checksum of the map, cheap equality hint only
    checksum: u32,
    /// Whether the execution ended on an abnormal termination
    pub did_crash: bool,
    /// Signal which ended the execution, 0 on a clean exit
    pub exit_signal: u8,
    /// Exit code of the target
    pub exit_code: u8,
    /// Wall clock time of the execution
    pub duration: Duration,
}

impl Trace {
    /// Create a new `Trace` taking ownership of the map snapshot
    pub fn new(
        map: Vec<u8>,
        did_crash: bool,
        exit_signal: u8,
        exit_code: u8,
        duration: Duration,
    ) -> Self {
        assert_eq!(map.len(), MAP_SIZE);
        let checksum = Self::compute_checksum(&map);

        Self {
            map,
            checksum,
            did_crash,
            exit_signal,
            exit_code,
            duration,
        }
    }

    fn compute_checksum(map: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(map);
        hasher.finalize()
    }

    /// Checksum of the map contents
    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Returns whether this trace is interesting compared to `baseline`.
    ///
    /// A trace is interesting iff it hit an edge the baseline never saw,
    /// or moved an already known edge into a higher frequency class.
    /// Ties and decreases are not interesting.
    pub fn compare_to(&self, baseline: &Trace) -> bool {
        for (&current, &base) in self.map.iter().zip(baseline.map.iter()) {
            if base == 0 && current != 0 {
                return true;
            }
            if bucket(current) > bucket(base) {
                return true;
            }
        }

        false
    }

    /// Number of edges hit at least once
    pub fn number_of_paths(&self) -> usize {
        self.map.iter().filter(|&&count| count != 0).count()
    }

    /// Merge this trace into `baseline`, pointwise maximum
    pub fn combine_into(&self, baseline: &mut Trace) {
        for (base, &current) in baseline.map.iter_mut().zip(self.map.iter()) {
            if current > *base {
                *base = current;
            }
        }
        baseline.checksum = Self::compute_checksum(&baseline.map);
    }
}
