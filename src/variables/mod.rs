//! Variable catalog, collections and target resolution.

mod bytes;
mod collection;
mod name;
mod resolver;
mod selector;
mod store;

pub use bytes::{has_invalid_utf8, lossless_string, lossless_text, wire_bytes};
pub use collection::Map;
pub use name::{VariableKind, VariableName};
pub use resolver::{resolve, MatchData};
pub use selector::{Selection, VariableSpec};
pub use store::TransactionVariables;
