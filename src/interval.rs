//! Byte-interval bookkeeping over the image buffer.
//!
//! A flat, grow-only collection of `[start, len)` ranges. The usage pattern
//! everywhere in the packer is add-all-then-flatten: collect every region a
//! processor touches, sort and coalesce once, then either zero the covered
//! bytes or inspect whether the regions form a single contiguous run.

/// A set of half-open byte ranges over some base buffer.
#[derive(Debug, Clone, Default)]
pub struct Interval {
    ranges: Vec<(u32, u32)>,
}

impl Interval {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `[start, start+len)` range.
    pub fn add(&mut self, start: u32, len: u32) {
        self.ranges.push((start, len));
    }

    /// Add every range of another interval set.
    pub fn add_interval(&mut self, other: &Interval) {
        self.ranges.extend_from_slice(&other.ranges);
    }

    /// Number of ranges currently stored.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The ranges as stored.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Sort by start and coalesce overlapping or adjacent ranges.
    ///
    /// Ties on start sort the longer range first so coalescing absorbs the
    /// shorter one. Afterwards the ranges are sorted and disjoint:
    /// `start[i] + len[i] < start[i+1]` for every consecutive pair.
    pub fn flatten(&mut self) {
        if self.ranges.is_empty() {
            return;
        }
        self.ranges
            .sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let mut out: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(start, len) in &self.ranges {
            match out.last_mut() {
                Some((cur_start, cur_len)) if *cur_start + *cur_len >= start => {
                    let end = start + len;
                    if end > *cur_start + *cur_len {
                        *cur_len = end - *cur_start;
                    }
                }
                _ => out.push((start, len)),
            }
        }
        self.ranges = out;
    }

    /// Zero every covered byte in `buf`. Ranges reaching past the end of
    /// the buffer are clamped.
    pub fn clear(&self, buf: &mut [u8]) {
        for &(start, len) in &self.ranges {
            let lo = (start as usize).min(buf.len());
            let hi = (start as usize + len as usize).min(buf.len());
            buf[lo..hi].fill(0);
        }
    }

    /// Total length covered by the stored ranges (meaningful after
    /// `flatten`).
    pub fn covered(&self) -> u32 {
        self.ranges.iter().map(|&(_, len)| len).sum()
    }
}
