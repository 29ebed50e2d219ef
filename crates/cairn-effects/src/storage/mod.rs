//! Durable store handlers

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemDurableStore;
pub use memory::MemoryDurableStore;
