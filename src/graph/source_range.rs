//! Per-block record of where a block's bytes came from.

use crate::address::{AddressRange, RelativeAddress};

/// One `(destination subrange, source subrange)` pair of a block's history.
///
/// The destination side is a range of offsets inside the block; the source side is the range
/// of original-image RVAs those bytes were derived from, or `None` for bytes a transform
/// synthesized. When present, the source range has the same length as the destination range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRangePair {
    dst_offset: u32,
    size: u32,
    source: Option<RelativeAddress>,
}

impl SourceRangePair {
    /// The first covered block offset.
    #[must_use]
    pub fn dst_offset(&self) -> u32 {
        self.dst_offset
    }

    /// The number of covered bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The first byte past the covered block offsets.
    #[must_use]
    pub fn dst_end(&self) -> u32 {
        self.dst_offset + self.size
    }

    /// The original-image RVA the first covered byte came from, if any.
    #[must_use]
    pub fn source(&self) -> Option<RelativeAddress> {
        self.source
    }

    /// The original-image range the pair covers, if the bytes are not synthetic.
    #[must_use]
    pub fn source_range(&self) -> Option<AddressRange<RelativeAddress>> {
        self.source.map(|s| AddressRange::new(s, self.size))
    }

    /// Whether the covered bytes were synthesized rather than derived from the original.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.source.is_none()
    }
}

/// The append-only source-range history of a block.
///
/// Pairs are appended in destination order; adjacent pairs that continue a linear source
/// mapping merge. A well-formed history's destination subranges are disjoint and cover
/// `[0, block size)` exactly, which [`is_cover_of`](Self::is_cover_of) checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRanges {
    pairs: Vec<SourceRangePair>,
}

impl SourceRanges {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Creates a history that maps `[0, size)` to the identical-length original range at
    /// `source`. This is the shape every decomposed block starts with.
    #[must_use]
    pub fn identity(source: RelativeAddress, size: u32) -> Self {
        let mut ranges = Self::new();
        ranges.push(0, size, Some(source));
        ranges
    }

    /// The recorded pairs, in destination order.
    #[must_use]
    pub fn pairs(&self) -> &[SourceRangePair] {
        &self.pairs
    }

    /// Whether the history records nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Appends a pair covering `[dst_offset, dst_offset + size)`.
    ///
    /// `source` is `None` for synthetic bytes. Appends must be in destination order; a pair
    /// that continues the previous one linearly (contiguous destination, contiguous source
    /// or both synthetic) is merged into it.
    pub fn push(&mut self, dst_offset: u32, size: u32, source: Option<RelativeAddress>) {
        if size == 0 {
            return;
        }
        debug_assert!(
            self.pairs.last().is_none_or(|p| p.dst_end() <= dst_offset),
            "source ranges must be appended in destination order"
        );

        if let Some(last) = self.pairs.last_mut() {
            if last.dst_end() == dst_offset {
                let continues = match (last.source, source) {
                    (Some(a), Some(b)) => a + last.size == b,
                    (None, None) => true,
                    _ => false,
                };
                if continues {
                    last.size += size;
                    return;
                }
            }
        }

        self.pairs.push(SourceRangePair {
            dst_offset,
            size,
            source,
        });
    }

    /// Appends another history, shifting its destination offsets by `dst_shift`.
    pub fn append_shifted(&mut self, other: &SourceRanges, dst_shift: u32) {
        for pair in &other.pairs {
            self.push(pair.dst_offset + dst_shift, pair.size, pair.source);
        }
    }

    /// Whether the destination subranges are disjoint and cover `[0, size)` exactly.
    #[must_use]
    pub fn is_cover_of(&self, size: u32) -> bool {
        let mut expected = 0;
        for pair in &self.pairs {
            if pair.dst_offset != expected {
                return false;
            }
            expected = pair.dst_end();
        }
        expected == size
    }

    /// Maps a block offset back to the original-image RVA it was derived from.
    ///
    /// Returns `None` for synthetic bytes and offsets outside the recorded cover.
    #[must_use]
    pub fn map_offset(&self, offset: u32) -> Option<RelativeAddress> {
        let index = self.pairs.partition_point(|p| p.dst_end() <= offset);
        let pair = self.pairs.get(index)?;
        if offset < pair.dst_offset {
            return None;
        }
        pair.source.map(|s| s + (offset - pair.dst_offset))
    }
}
