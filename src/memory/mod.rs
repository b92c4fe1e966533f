//! 记忆层：三层存储（工作 / 情景 / 语义）与检索

pub mod store;

pub use store::{MemoryEntry, MemoryKind, MemoryStore};
