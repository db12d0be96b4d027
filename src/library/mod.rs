//! 本地书库。

pub mod index;

pub use index::{LibraryIndex, LocalBook};
