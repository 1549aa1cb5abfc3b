//! Small standalone helpers shared across the paging engine that don't
//! depend on any of its other crates.

pub mod byte;

pub use byte::ByteSize;
