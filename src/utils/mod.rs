//! Small internal helpers shared across modules.

mod visited;

pub use visited::VisitedMap;
