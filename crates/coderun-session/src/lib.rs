//! Session orchestration and storage for code sessions.
//!
//! Provides:
//! - `Multiplexer` - Route a local run and a remote session to each other
//! - `FileTransferCursor` - Split the remote data stream into files
//! - `AttachmentBundle` - Import unpacked archives under the attachment root
//! - Virtual file stores (memory, disk)

pub mod attachments;
pub mod cursor;
pub mod multiplexer;
pub mod storage;

pub use attachments::{AttachmentBundle, AttachmentFile};
pub use cursor::{FileTransferCursor, HeaderError, Route};
pub use multiplexer::{Multiplexer, MuxError, ServiceSelection};

#[cfg(feature = "disk")]
pub use storage::DiskFileStore;
#[cfg(feature = "memory")]
pub use storage::MemoryFileStore;
