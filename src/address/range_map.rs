//! A mapping between address ranges of two (possibly different) address spaces.
//!
//! [`AddressRangeMap`] is the workhorse of the source-range machinery: every block records
//! through one how its bytes were derived from the original image, and the layout phase
//! builds one to relate the transformed image back to the original before deriving the
//! monotone translation tables the debug format consumes.

use std::fmt;

use crate::address::{Address, AddressRange};

/// One `(source range, destination range)` pair of an [`AddressRangeMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePair<S, D> {
    /// The range in the map's source address space.
    pub source: AddressRange<S>,
    /// The range the source maps onto in the destination address space.
    pub destination: AddressRange<D>,
}

impl<S: Address, D: Address> RangePair<S, D> {
    /// Creates a new pair.
    #[must_use]
    pub fn new(source: AddressRange<S>, destination: AddressRange<D>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Whether the pair maps its source onto a destination of equal length, i.e. is a pure
    /// shift of a contiguous range.
    #[must_use]
    pub fn is_identity_shift(&self) -> bool {
        self.source.size() == self.destination.size()
    }
}

impl<S: Address, D: Address> fmt::Display for RangePair<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// An ordered mapping from source address ranges to destination address ranges.
///
/// Entries are kept sorted by source range. Insertion follows three rules:
///
/// - Adjacent pairs that continue a linear identity shift (source ranges abut, destination
///   ranges abut, and each pair maps onto an equal-length destination) are merged into one.
/// - A pair whose source range partially overlaps existing pairs replaces them only when it
///   is strictly longer at that source position; otherwise the insertion is rejected. This
///   "longest mapping wins" rule makes the structure robust to speculative inserts.
/// - A pair whose source range exactly equals an existing entry's source range is recorded
///   as a parallel entry: the source was duplicated into several destinations. Parallel
///   entries are what [`compute_inverse`](Self::compute_inverse) reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRangeMap<S, D> {
    pairs: Vec<RangePair<S, D>>,
}

impl<S: Address, D: Address> AddressRangeMap<S, D> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// The number of range pairs in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the map holds no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The pairs of the map, in source order.
    #[must_use]
    pub fn pairs(&self) -> &[RangePair<S, D>] {
        &self.pairs
    }

    /// Iterates the pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = &RangePair<S, D>> {
        self.pairs.iter()
    }

    /// Inserts the pair `(source, destination)`.
    ///
    /// Returns `true` if the map changed (or already contained the identical pair), `false`
    /// if the insertion was rejected because an overlapping existing mapping is at least as
    /// long as the new one.
    pub fn insert(
        &mut self,
        source: AddressRange<S>,
        destination: AddressRange<D>,
    ) -> bool {
        if source.is_empty() {
            return false;
        }

        // Index of the first pair whose source may overlap the new source.
        let mut index = self
            .pairs
            .partition_point(|p| p.source.end() <= source.start());

        let mut exact_duplicate = false;
        let mut scan = index;
        while scan < self.pairs.len() && self.pairs[scan].source.start() < source.end() {
            let existing = &self.pairs[scan];
            if existing.source == source {
                if existing.destination == destination {
                    return true;
                }
                exact_duplicate = true;
                scan += 1;
                continue;
            }
            if existing.source.size() >= source.size() {
                return false;
            }
            scan += 1;
        }

        if exact_duplicate {
            // A duplicated source: keep every parallel entry, ordered by destination.
            while index < self.pairs.len()
                && self.pairs[index].source == source
                && self.pairs[index].destination.start() < destination.start()
            {
                index += 1;
            }
            self.pairs
                .insert(index, RangePair::new(source, destination));
            return true;
        }

        // Longest mapping wins: drop every strictly shorter overlapping pair.
        self.pairs
            .retain(|p| !(p.source.intersects(&source) && p.source.size() < source.size()));

        let index = self
            .pairs
            .partition_point(|p| p.source.start() < source.start());
        self.pairs
            .insert(index, RangePair::new(source, destination));

        self.merge_at(index);
        if index > 0 {
            self.merge_at(index - 1);
        }

        true
    }

    /// Merges `pairs[index]` with `pairs[index + 1]` when they continue a linear identity
    /// shift across both sides.
    fn merge_at(&mut self, index: usize) {
        if index + 1 >= self.pairs.len() {
            return;
        }

        let (a, b) = (&self.pairs[index], &self.pairs[index + 1]);
        let continuous = a.is_identity_shift()
            && b.is_identity_shift()
            && a.source.end() == b.source.start()
            && a.destination.end() == b.destination.start();
        if !continuous {
            return;
        }

        let merged = RangePair::new(
            AddressRange::new(a.source.start(), a.source.size() + b.source.size()),
            AddressRange::new(
                a.destination.start(),
                a.destination.size() + b.destination.size(),
            ),
        );
        self.pairs[index] = merged;
        self.pairs.remove(index + 1);
    }

    /// Finds the pair whose source range contains `address`.
    ///
    /// When the address falls into a duplicated source range, the parallel entry with the
    /// lowest destination is returned.
    #[must_use]
    pub fn find_containing(&self, address: S) -> Option<&RangePair<S, D>> {
        let index = self.pairs.partition_point(|p| p.source.end() <= address);
        self.pairs
            .get(index)
            .filter(|p| p.source.contains(address))
    }

    /// Translates a source address through the map.
    ///
    /// The address is shifted by its offset inside the containing source range, clamped to
    /// the destination extent so that a source longer than its destination never maps past
    /// the destination end.
    #[must_use]
    pub fn translate(&self, address: S) -> Option<D> {
        let pair = self.find_containing(address)?;
        let offset = address - pair.source.start();
        let clamped = offset.min(i64::from(pair.destination.size().saturating_sub(1)));
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        Some(pair.destination.start() + clamped as u32)
    }

    /// Computes the reverse map.
    ///
    /// Every pair `(s, d)` becomes `(d, s)` in the result. The returned count reports how
    /// many source ranges of `self` had multiple destination preimages (the source was
    /// duplicated); a non-zero count means `inverse(inverse(m))` cannot reproduce `m`
    /// exactly.
    #[must_use]
    pub fn compute_inverse(&self) -> (AddressRangeMap<D, S>, usize) {
        let mut duplicated = 0;
        for window in self.pairs.windows(2) {
            if window[0].source == window[1].source {
                duplicated += 1;
            }
        }

        let mut inverse = AddressRangeMap::new();
        for pair in &self.pairs {
            inverse.insert(pair.destination, pair.source);
        }
        (inverse, duplicated)
    }
}
