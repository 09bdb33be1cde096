mod memory;
mod sql;

pub use memory::MemorySource;
pub use sql::SqlSource;
