//! XML document model used by every stage of the loader: an arena-backed
//! tree with copyable node handles, an event-based parser and serializer,
//! and the path query engine that merge sections and patch scripts use to
//! address nodes.

mod parse;
mod serialize;
mod tree;

pub mod query;

pub use parse::{parse, parse_recovering, ParseError};
pub use serialize::{serialize, SerializeError};
pub use tree::{Attribute, DocumentTree, ElementTemplate, NodeId, NodeTemplate};
