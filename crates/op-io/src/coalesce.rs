//! Merging adjacent export ranges into fewer, larger reads

use op_core::config::PrecacheConfig;

/// Serialized range of one export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRange {
    pub slot: u32,
    pub offset: u64,
    pub len: u64,
}

/// One read covering one or more exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRead {
    pub offset: u64,
    pub len: u64,
    pub slots: Vec<u32>,
}

impl MergedRead {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Merge `ranges` into reads bounded by the gap, size and count limits.
///
/// Empty ranges are skipped. Every non-empty range lands in exactly one read.
pub fn coalesce(ranges: &[ExportRange], config: &PrecacheConfig) -> Vec<MergedRead> {
    let mut sorted: Vec<ExportRange> = ranges.iter().copied().filter(|r| r.len > 0).collect();
    sorted.sort_by_key(|r| (r.offset, r.slot));

    let max_exports = config.max_exports_per_read.max(1);
    let mut reads: Vec<MergedRead> = Vec::new();
    for range in sorted {
        let range_end = range.offset + range.len;
        if let Some(current) = reads.last_mut() {
            let end = current.end();
            let gap = range.offset.saturating_sub(end);
            let merged_len = range_end.max(end) - current.offset;
            if gap <= config.max_gap_bytes
                && merged_len <= config.max_merged_bytes
                && current.slots.len() < max_exports
            {
                current.len = merged_len;
                current.slots.push(range.slot);
                continue;
            }
        }
        reads.push(MergedRead {
            offset: range.offset,
            len: range.len,
            slots: vec![range.slot],
        });
    }
    reads
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PrecacheConfig {
        PrecacheConfig {
            min_read_size: 16,
            max_merged_bytes: 100,
            max_gap_bytes: 8,
            max_exports_per_read: 3,
            memory_budget_bytes: 1024,
        }
    }

    fn range(slot: u32, offset: u64, len: u64) -> ExportRange {
        ExportRange { slot, offset, len }
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let reads = coalesce(&[range(1, 10, 10), range(0, 0, 10)], &config());
        assert_eq!(
            reads,
            vec![MergedRead {
                offset: 0,
                len: 20,
                slots: vec![0, 1]
            }]
        );
    }

    #[test]
    fn test_gap_limit() {
        let reads = coalesce(&[range(0, 0, 10), range(1, 18, 2), range(2, 40, 2)], &config());
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].slots, vec![0, 1]);
        assert_eq!(reads[0].len, 20);
        assert_eq!(reads[1].slots, vec![2]);
    }

    #[test]
    fn test_size_and_count_limits() {
        let reads = coalesce(&[range(0, 0, 60), range(1, 60, 60)], &config());
        assert_eq!(reads.len(), 2);

        let small: Vec<ExportRange> = (0..7).map(|i| range(i, i as u64 * 4, 4)).collect();
        let reads = coalesce(&small, &config());
        assert_eq!(reads.iter().map(|r| r.slots.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[test]
    fn test_oversized_single_range_and_empty() {
        let reads = coalesce(&[range(0, 0, 500), range(1, 500, 0)], &config());
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].len, 500);
        assert!(coalesce(&[], &config()).is_empty());
    }
}
