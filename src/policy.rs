//! The transform policy: which blocks may be decomposed, which references redirected.
//!
//! Basic-block decomposition is only sound for code the decomposer fully understands. The
//! policy encodes the conservative rules that keep transforms away from everything else,
//! and caches its verdicts: block ids are never reused within a graph instance, so a
//! cached verdict stays valid until a mutator explicitly invalidates it.

use std::cell::RefCell;

use log::trace;
use rustc_hash::FxHashMap;

use crate::graph::{
    Block, BlockAttributes, BlockGraph, BlockId, BlockType, LabelAttributes, Reference,
};

/// Answers the two policy questions of the rewriter core.
pub trait RedecompositionPolicy {
    /// Whether `block` is safe to decompose into basic blocks.
    fn block_is_safe_to_decompose(&self, graph: &BlockGraph<'_>, block: BlockId) -> bool;

    /// Whether `reference` may be redirected to an equivalent location.
    fn reference_is_safe_to_redirect(&self, graph: &BlockGraph<'_>, reference: &Reference)
        -> bool;

    /// Drops the cached verdict for `block`. Mutators that change a block's labels,
    /// references or attributes call this.
    fn invalidate(&self, block: BlockId);

    /// Drops every cached verdict.
    fn invalidate_all(&self);
}

/// The default policy.
#[derive(Debug, Default)]
pub struct DefaultRedecompositionPolicy {
    allow_inline_assembly: bool,
    cache: RefCell<FxHashMap<BlockId, bool>>,
}

impl DefaultRedecompositionPolicy {
    /// Creates the default policy: inline assembly is not decomposed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that also decomposes functions flagged as containing inline
    /// assembly. Only sound when the inline assembly follows compiler conventions.
    #[must_use]
    pub fn allowing_inline_assembly() -> Self {
        Self {
            allow_inline_assembly: true,
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// The uncached classification.
    fn classify(&self, graph: &BlockGraph<'_>, block: &Block<'_>) -> bool {
        if block.block_type() != BlockType::Code {
            return false;
        }

        // Blocks this system emitted are decomposable by construction.
        if block.has_attributes(BlockAttributes::BUILT_BY_PEWEAVE) {
            return true;
        }

        if block
            .attributes()
            .intersects(BlockAttributes::unsafe_for_decomposition())
        {
            trace!("{} unsafe: attributes {:?}", block.id(), block.attributes());
            return false;
        }
        if block.has_attributes(BlockAttributes::HAS_INLINE_ASSEMBLY)
            && !self.allow_inline_assembly
        {
            trace!("{} unsafe: inline assembly", block.id());
            return false;
        }

        if !self.has_reliable_entry_point(block) {
            trace!("{} unsafe: no private code symbol", block.id());
            return false;
        }
        if !Self::labels_follow_code_then_data(block) {
            trace!("{} unsafe: label layout", block.id());
            return false;
        }
        if !Self::outgoing_references_are_safe(graph, block) {
            trace!("{} unsafe: outgoing references", block.id());
            return false;
        }
        if !Self::inbound_referrers_are_safe(graph, block) {
            trace!("{} unsafe: inbound referrers", block.id());
            return false;
        }
        true
    }

    /// The disassembler needs at least one private code symbol as a trusted entry point.
    fn has_reliable_entry_point(&self, block: &Block<'_>) -> bool {
        block.labels().values().any(|label| {
            label.has_attributes(LabelAttributes::CODE)
                && !label.has_attributes(LabelAttributes::PUBLIC_SYMBOL)
        })
    }

    /// Code labels at the head, then data labels only, then an optional debug-end.
    fn labels_follow_code_then_data(block: &Block<'_>) -> bool {
        let mut seen_data = false;
        for (&offset, label) in block.labels() {
            if offset == block.size() {
                // One-past-the-end labels (debug-end) are exempt from the shape rule.
                continue;
            }
            if label.has_attributes(LabelAttributes::DATA) {
                if offset == 0 {
                    // A code block must not start with data.
                    return false;
                }
                seen_data = true;
            } else if label.has_attributes(LabelAttributes::CODE) && seen_data {
                return false;
            }
        }
        true
    }

    /// Direct references go anywhere; indirect references may only name tables in data.
    fn outgoing_references_are_safe(graph: &BlockGraph<'_>, block: &Block<'_>) -> bool {
        for reference in block.references().values() {
            if reference.is_direct() {
                continue;
            }
            if reference.target() == block.id() {
                return false;
            }
            let targets_data = graph
                .block(reference.target())
                .is_some_and(|b| b.block_type() == BlockType::Data);
            if !targets_data {
                return false;
            }
        }
        true
    }

    /// Self references must be pc-relative or absolute; external references may only
    /// enter at the head or at a label.
    fn inbound_referrers_are_safe(graph: &BlockGraph<'_>, block: &Block<'_>) -> bool {
        for &(referrer, offset) in block.referrers() {
            let Some(reference) = graph.reference_of(referrer, offset) else {
                return false;
            };
            if referrer == block.id() {
                if !matches!(
                    reference.ref_type(),
                    crate::graph::ReferenceType::PcRelative
                        | crate::graph::ReferenceType::Absolute
                ) {
                    return false;
                }
                continue;
            }
            let base = reference.base();
            if base != 0 {
                let Ok(base) = u32::try_from(base) else {
                    return false;
                };
                if block.label_at(base).is_none() {
                    return false;
                }
            }
        }
        true
    }
}

impl RedecompositionPolicy for DefaultRedecompositionPolicy {
    fn block_is_safe_to_decompose(&self, graph: &BlockGraph<'_>, block: BlockId) -> bool {
        if let Some(&cached) = self.cache.borrow().get(&block) {
            return cached;
        }
        let Some(block_ref) = graph.block(block) else {
            return false;
        };
        let verdict = self.classify(graph, block_ref);
        self.cache.borrow_mut().insert(block, verdict);
        verdict
    }

    fn reference_is_safe_to_redirect(
        &self,
        graph: &BlockGraph<'_>,
        reference: &Reference,
    ) -> bool {
        // Any well-formed reference whose target the graph can describe is redirectable.
        reference.is_valid() && graph.block(reference.target()).is_some()
    }

    fn invalidate(&self, block: BlockId) {
        self.cache.borrow_mut().remove(&block);
    }

    fn invalidate_all(&self) {
        self.cache.borrow_mut().clear();
    }
}
