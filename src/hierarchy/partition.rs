//! Contiguous row ownership across ranks.

use crate::compgrid_error::CompGridError;

/// Block row partition: rank `r` owns global rows `starts[r]..starts[r + 1]`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RowPartition {
    starts: Vec<i64>,
}

impl RowPartition {
    /// Build from the first global row of every rank plus the global row count.
    pub fn from_starts(mut starts: Vec<i64>, total: i64) -> Result<Self, CompGridError> {
        starts.push(total);
        if starts.first().is_some_and(|&s| s != 0) || starts.windows(2).any(|w| w[0] > w[1]) {
            return Err(CompGridError::InvalidParams(format!(
                "row partition starts must begin at 0 and be non-decreasing: {starts:?}"
            )));
        }
        Ok(Self { starts })
    }

    /// Split `total` rows as evenly as possible over `ranks`, low ranks taking the remainder.
    pub fn uniform(total: i64, ranks: usize) -> Self {
        let ranks = ranks.max(1) as i64;
        let base = total / ranks;
        let extra = total % ranks;
        let mut starts = Vec::with_capacity(ranks as usize + 1);
        let mut next = 0;
        for r in 0..ranks {
            starts.push(next);
            next += base + i64::from(r < extra);
        }
        starts.push(total);
        Self { starts }
    }

    pub fn num_ranks(&self) -> usize {
        self.starts.len() - 1
    }

    pub fn total(&self) -> i64 {
        self.starts[self.starts.len() - 1]
    }

    /// First global row owned by `rank`.
    pub fn first(&self, rank: usize) -> i64 {
        self.starts[rank]
    }

    /// One past the last global row owned by `rank`.
    pub fn end(&self, rank: usize) -> i64 {
        self.starts[rank + 1]
    }

    pub fn len_of(&self, rank: usize) -> usize {
        (self.end(rank) - self.first(rank)) as usize
    }

    /// Owning rank of `global`, or `None` when it is outside `0..total`.
    pub fn owner_of(&self, global: i64) -> Option<usize> {
        if global < 0 || global >= self.total() {
            return None;
        }
        // last start <= global; empty ranks share a start with their successor
        Some(self.starts.partition_point(|&s| s <= global) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_split_gives_remainder_to_low_ranks() {
        let p = RowPartition::uniform(10, 3);
        assert_eq!((p.first(0), p.end(0)), (0, 4));
        assert_eq!((p.first(1), p.end(1)), (4, 7));
        assert_eq!((p.first(2), p.end(2)), (7, 10));
        assert_eq!(p.owner_of(6), Some(1));
        assert_eq!(p.owner_of(10), None);
    }

    #[test]
    fn empty_rank_never_owns() {
        let p = RowPartition::from_starts(vec![0, 3, 3], 5).unwrap();
        assert_eq!(p.len_of(1), 0);
        assert_eq!(p.owner_of(3), Some(2));
        assert_eq!(p.owner_of(2), Some(0));
    }

    #[test]
    fn decreasing_starts_are_rejected() {
        assert!(RowPartition::from_starts(vec![0, 4, 2], 6).is_err());
    }
}
