// Open-addressed hash index backing FastStorage's key -> offset lookup.

pub mod hash_index;

pub use hash_index::HashIndex;
