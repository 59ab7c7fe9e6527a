//! Embedding crate
//!
//! The lookup module exposes the embedding table that opens a decode chain and
//! emits the cache tags consumed by the quantized projection.

pub mod lookup;

pub use lookup::LookupTable;
