//! Canvas Model - drawable elements of a shared canvas document
//!
//! A canvas document is an ordered list of [`Element`]s, unique by id. Each
//! element carries a common base record (geometry, style, versioning) and a
//! per-type extension in [`ElementKind`]. Every field except `id` and `type`
//! has a serde default so partial payloads coming off the wire always
//! materialize into a renderable element.

mod element;
mod kind;

pub use element::*;
pub use kind::*;
