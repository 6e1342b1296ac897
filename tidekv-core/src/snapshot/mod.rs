//! Point-in-time snapshots of the key space
//!
//! One format serves two purposes: cold-start recovery from disk and the
//! payload a primary ships to a replica during a full resync.
//! - `format`: opcodes, length and string encodings, metadata
//! - `writer` / `reader`: encode and decode a whole snapshot in memory
//! - `engine`: the non-reentrant snapshot lock, atomic install, payload cache

pub mod engine;
pub mod format;
pub mod reader;
pub mod writer;

pub use engine::*;
pub use format::*;
pub use reader::*;
pub use writer::*;
