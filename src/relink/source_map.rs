//! The image-source map and the translation tables derived from it.
//!
//! After layout, every block knows both its new RVA (from the layout) and where its bytes
//! came from (its source ranges). Folding the two together yields the bidirectional
//! address-range map between the new and original images; from either direction the
//! monotone translation table the debug format consumes is derived.

use crate::address::{
    AddressRange, AddressRangeMap, AddressTranslationTable, RelativeAddress, TranslationEntry,
    INVALID_TARGET_RVA,
};
use crate::graph::BlockGraph;
use crate::relink::ImageLayout;

/// Both translation directions, ready for the debug writer.
#[derive(Debug, Clone)]
pub struct TranslationTables {
    /// Maps addresses of the transformed image back to the original.
    pub new_to_old: AddressTranslationTable,
    /// Maps addresses of the original image into the transformed one.
    pub old_to_new: AddressTranslationTable,
}

/// Builds the map from new-image RVAs to original-image RVAs.
///
/// Iterates each block's source-range history in layout order; synthetic ranges (bytes a
/// transform emitted) contribute nothing, they simply have no original counterpart.
#[must_use]
pub fn build_image_source_map(
    graph: &BlockGraph<'_>,
    layout: &ImageLayout,
) -> AddressRangeMap<RelativeAddress, RelativeAddress> {
    let mut map = AddressRangeMap::new();
    for section in &layout.sections {
        for &(rva, block_id) in &section.blocks {
            let Some(block) = graph.block(block_id) else {
                continue;
            };
            for pair in block.source_ranges().pairs() {
                let Some(source) = pair.source() else {
                    continue;
                };
                map.insert(
                    AddressRange::new(rva + pair.dst_offset(), pair.size()),
                    AddressRange::new(source, pair.size()),
                );
            }
        }
    }
    map
}

/// Derives the monotone translation table for `covered` from `map`.
///
/// Each emitted entry implicitly covers up to the next entry. Subranges of `covered` that
/// no map pair spans point at the sentinel. A pair whose source side is longer than its
/// destination is expanded into multiple entries of at most one destination length, all
/// aimed at the destination start, so no source byte maps past the destination extent. A
/// final cap entry at `covered.end()` terminates the table.
#[must_use]
pub fn build_address_translation_table(
    covered: AddressRange<RelativeAddress>,
    map: &AddressRangeMap<RelativeAddress, RelativeAddress>,
) -> AddressTranslationTable {
    let mut entries: Vec<TranslationEntry> = Vec::new();
    let mut cursor = covered.start();

    for pair in map.iter() {
        let source = pair.source;
        let destination = pair.destination;
        if source.end() <= cursor || source.start() >= covered.end() {
            // Outside the uncovered remainder: duplicated-source parallels and pairs
            // beyond the covered range contribute nothing.
            continue;
        }

        if source.start() > cursor {
            entries.push(TranslationEntry {
                rva: cursor,
                rva_to: INVALID_TARGET_RVA,
            });
        }

        if destination.size() > 0 && source.size() > destination.size() {
            // Fold an oversized source onto its destination in destination-sized steps.
            let mut from = source.start();
            while from < source.end() {
                entries.push(TranslationEntry {
                    rva: from,
                    rva_to: destination.start(),
                });
                from += destination.size();
            }
        } else {
            entries.push(TranslationEntry {
                rva: source.start(),
                rva_to: destination.start(),
            });
        }
        cursor = source.end();
    }

    if cursor < covered.end() {
        entries.push(TranslationEntry {
            rva: cursor,
            rva_to: INVALID_TARGET_RVA,
        });
    }
    entries.push(TranslationEntry {
        rva: covered.end(),
        rva_to: INVALID_TARGET_RVA,
    });

    AddressTranslationTable::from_entries(entries)
}

/// Builds both translation directions.
///
/// Returns the tables and the number of original source ranges that were duplicated into
/// multiple new locations (those cannot be inverted faithfully; debuggers resolve them to
/// the lowest new address).
#[must_use]
pub fn build_translation_tables(
    graph: &BlockGraph<'_>,
    layout: &ImageLayout,
    original_extent: AddressRange<RelativeAddress>,
) -> (TranslationTables, usize) {
    let new_to_old_map = build_image_source_map(graph, layout);
    let (old_to_new_map, duplicated) = new_to_old_map.compute_inverse();

    let new_extent = AddressRange::new(RelativeAddress::ZERO, layout.extent().value());
    let tables = TranslationTables {
        new_to_old: build_address_translation_table(new_extent, &new_to_old_map),
        old_to_new: build_address_translation_table(original_extent, &old_to_new_map),
    };
    (tables, duplicated)
}

/// Collects the output image's relocation entries: one per absolute reference, nothing
/// else, sorted ascending.
#[must_use]
pub fn build_relocation_table(graph: &BlockGraph<'_>, layout: &ImageLayout) -> Vec<RelativeAddress> {
    let mut rvas = Vec::new();
    for section in &layout.sections {
        for &(rva, block_id) in &section.blocks {
            let Some(block) = graph.block(block_id) else {
                continue;
            };
            for (&offset, reference) in block.references() {
                if reference.ref_type() == crate::graph::ReferenceType::Absolute {
                    rvas.push(rva + offset);
                }
            }
        }
    }
    rvas.sort_unstable();
    rvas
}
