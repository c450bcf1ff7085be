//! Block-fetch bucket table.
//!
//! In performant mode each submission carries a bucket hint telling the
//! adapter how many 16-byte blocks of the request frame to fetch. The table
//! is rebuilt from the firmware's scatter-gather limit on every bring-up.

use protocol_ciss::BUCKET_COUNT;

use crate::error::Error;

/// Blocks occupied by the frame header before the first SG entry.
pub const HEADER_BLOCKS: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTable {
    /// Bucket capacities in blocks, ascending. Unused trailing buckets
    /// repeat the last size.
    sizes: [u16; BUCKET_COUNT],
    /// Bucket index for each scatter count `0..=max_sg`.
    map: Vec<u8>,
}

impl BucketTable {
    /// Build the table from ascending `thresholds` plus a final bucket of
    /// `max_sg + HEADER_BLOCKS`. Thresholds not below the final size are
    /// dropped.
    pub fn build(thresholds: &[u16], max_sg: u16) -> Result<Self, Error> {
        if thresholds.len() > BUCKET_COUNT - 1 {
            return Err(Error::Config(format!(
                "at most {} fetch thresholds",
                BUCKET_COUNT - 1
            )));
        }
        let last = max_sg + HEADER_BLOCKS;
        let mut sizes = [last; BUCKET_COUNT];
        let mut count = 0;
        for &t in thresholds.iter().filter(|&&t| t < last) {
            if count > 0 && sizes[count - 1] >= t {
                return Err(Error::Config("fetch thresholds must ascend".into()));
            }
            sizes[count] = t;
            count += 1;
        }

        let map = (0..=max_sg)
            .map(|sg| {
                let need = sg + HEADER_BLOCKS;
                // The final bucket always fits, so the search cannot fail.
                sizes
                    .iter()
                    .position(|&size| size >= need)
                    .unwrap_or(BUCKET_COUNT - 1) as u8
            })
            .collect();

        Ok(BucketTable { sizes, map })
    }

    /// Bucket hint for a scatter list of `sg_count` entries.
    #[inline]
    pub fn bucket_for(&self, sg_count: usize) -> Option<u8> {
        self.map.get(sg_count).copied()
    }

    pub fn sizes(&self) -> [u16; BUCKET_COUNT] {
        self.sizes
    }

    pub fn max_sg(&self) -> usize {
        self.map.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: [u16; 7] = [5, 6, 8, 10, 12, 20, 28];

    #[test]
    fn default_thresholds() {
        let table = BucketTable::build(&DEFAULT, 32).unwrap();
        assert_eq!(table.sizes(), [5, 6, 8, 10, 12, 20, 28, 36]);
        // 0 SG entries need 4 blocks -> bucket 0 (5 blocks).
        assert_eq!(table.bucket_for(0), Some(0));
        assert_eq!(table.bucket_for(1), Some(0));
        assert_eq!(table.bucket_for(2), Some(1));
        assert_eq!(table.bucket_for(3), Some(2));
        assert_eq!(table.bucket_for(16), Some(5));
        assert_eq!(table.bucket_for(17), Some(6));
        assert_eq!(table.bucket_for(32), Some(7));
        assert_eq!(table.bucket_for(33), None);
    }

    #[test]
    fn every_count_gets_smallest_fitting_bucket() {
        let table = BucketTable::build(&DEFAULT, 32).unwrap();
        let sizes = table.sizes();
        for sg in 0..=32usize {
            let b = table.bucket_for(sg).unwrap() as usize;
            let need = sg as u16 + HEADER_BLOCKS;
            assert!(sizes[b] >= need);
            assert!(b == 0 || sizes[b - 1] < need);
        }
    }

    #[test]
    fn small_firmware_limit_drops_large_thresholds() {
        let table = BucketTable::build(&DEFAULT, 4).unwrap();
        assert_eq!(table.sizes(), [5, 6, 8, 8, 8, 8, 8, 8]);
        assert_eq!(table.bucket_for(4), Some(2));
        assert_eq!(table.max_sg(), 4);
    }

    #[test]
    fn rebuild_is_identical() {
        let a = BucketTable::build(&DEFAULT, 31).unwrap();
        let b = BucketTable::build(&DEFAULT, 31).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_descending_thresholds() {
        assert!(BucketTable::build(&[8, 5], 32).is_err());
    }
}
