// Copyright 2026 The peweave authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # peweave
//!
//! A post-link binary rewriting framework for 32-bit Windows PE executables and their
//! debug databases. Given a parsed module and its symbol information, `peweave`
//! decomposes the image into a typed graph of addressable regions and cross-references
//! (the block graph), lets transforms edit that graph at block or basic-block
//! granularity, chooses a new layout, and derives everything the image and debug writers
//! need to emit a working module whose debug database still resolves against the
//! original addresses.
//!
//! ## Architecture
//!
//! `peweave` is organized into several key modules:
//!
//! - [`address`] - typed address spaces, half-open ranges, range maps, translation tables
//! - [`graph`] - the block graph: blocks, references, labels, sections, source ranges
//! - [`fixup`] - the fixup map derived from the debug database's FIXUP stream
//! - [`input`] - the data contract external PE/debug parsers populate
//! - [`decomposer`] - module inputs to a populated block graph
//! - [`basicblock`] - basic-block decomposition, assembly, and reassembly
//! - [`policy`] - which blocks are safe to decompose, which references to redirect
//! - [`relink`] - layout, image-source mapping, translation tables, the pipeline
//!
//! The PE container itself, the debug database container, concrete transforms and CLI
//! frontends are external collaborators; this crate is the core they drive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peweave::prelude::*;
//!
//! # fn load() -> peweave::input::ModuleInput<'static> { unimplemented!() }
//! let input: ModuleInput<'_> = load(); // from your PE/debug parser
//! let mut pipeline = RelinkPipeline::new(uguid::guid!("01234567-89ab-cdef-0123-456789abcdef"));
//! let output = pipeline.run(&input)?;
//! println!(
//!     "laid out {} sections, {} relocations",
//!     output.layout.sections.len(),
//!     output.relocations.len()
//! );
//! # Ok::<(), peweave::Error>(())
//! ```
//!
//! ## Basic-Block Editing
//!
//! Transforms that need to splice instructions into existing functions decompose a block
//! into a [`basicblock::BasicBlockSubgraph`], edit it with the
//! [`basicblock::BasicBlockAssembler`], and rebuild it with the
//! [`basicblock::BlockBuilder`]; see the [`basicblock`] module documentation.
//!
//! ## Threading
//!
//! The core executes on a single thread and performs no internal concurrency. All
//! containers require exclusive access for mutation, every mutator either fully succeeds
//! or leaves its container unchanged, and iteration orders are deterministic so layouts
//! and debug tables are reproducible.

#[macro_use]
pub(crate) mod error;

pub mod address;
pub mod basicblock;
pub mod decomposer;
pub mod fixup;
pub mod graph;
pub mod input;
pub mod policy;
pub mod prelude;
pub mod relink;

pub(crate) mod utils;

/// The result type used throughout peweave.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;
