//! Message store implementations

mod file;
mod memory;

pub use file::{FileMessageStore, FileMessageStoreBuilder};
pub use memory::MemoryMessageStore;
