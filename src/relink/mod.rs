//! Relink orchestration: layout, source mapping, and the fixed pipeline.
//!
//! Control flow through a relink is unidirectional: the image decomposer populates the
//! block graph, transforms mutate it, the orderer and [`LayoutBuilder`] produce the final
//! address assignment, and the image-source map ties the transformed image back to the
//! original before being folded into the translation tables the debug writer consumes.

mod layout;
mod pipeline;
mod source_map;

pub use layout::{BlockOrderer, ImageLayout, LayoutBuilder, OriginalOrderer, SectionLayout};
pub use pipeline::{
    apply_basic_block_transform, BasicBlockSubgraphTransform, BlockGraphTransform,
    RelinkOutput, RelinkPipeline,
};
pub use source_map::{
    build_address_translation_table, build_image_source_map, build_relocation_table,
    build_translation_tables, TranslationTables,
};
