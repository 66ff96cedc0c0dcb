//! Address primitives, typed ranges, and range mappings.
//!
//! Three address spaces are distinguished in the type system and never interconvert
//! implicitly:
//!
//! - [`AbsoluteAddress`] - virtual addresses after the loader applied the image base
//! - [`RelativeAddress`] - offsets from the module's load base (RVAs), the address kind used
//!   in almost all public contracts of this crate
//! - [`FileOffsetAddress`] - raw positions inside the module file on disk
//!
//! On top of the primitives sit half-open [`AddressRange`]s, the [`AddressRangeMap`] that
//! records how ranges of one image map onto ranges of another, and the sorted, monotone
//! [`AddressTranslationTable`] that debug tooling consumes.
//!
//! # Example
//!
//! ```rust
//! use peweave::address::{AddressRange, RelativeAddress};
//!
//! let range = AddressRange::new(RelativeAddress::new(0x1000), 0x200);
//! assert_eq!(range.end(), RelativeAddress::new(0x1200));
//! assert!(range.contains(RelativeAddress::new(0x11ff)));
//! assert!(!range.contains(range.end()));
//! ```

mod range_map;
mod translation;
mod types;

pub use range_map::{AddressRangeMap, RangePair};
pub use translation::{AddressTranslationTable, TranslationEntry, INVALID_TARGET_RVA};
pub use types::{AbsoluteAddress, Address, AddressRange, FileOffsetAddress, RelativeAddress};
