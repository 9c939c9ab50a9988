// # FastStorage Engine
//
// The mmap'd append-log key-value store (SPEC_FULL.md §4.2) plus its
// on-disk record framing and checksum support. This is the spill target
// for large change values and the secondary JSONL persistence namespace
// used by the event worker (`crate::watch::worker`).

pub mod checksum;
pub mod faststorage;
pub mod record;

pub use checksum::hardware_crc32c;
pub use faststorage::{FastStorage, FastStorageStats};
pub use record::{RecordHeader, StoreHeader, HEADER_SIZE, MAX_KEY_LEN, RECORD_HEADER_SIZE, STORE_MAGIC};
