//! Virtual file store implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "disk")]
pub mod disk;

#[cfg(feature = "disk")]
pub use disk::DiskFileStore;
#[cfg(feature = "memory")]
pub use memory::MemoryFileStore;
