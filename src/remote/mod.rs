//! 借阅服务：HTTP 客户端、返回数据模型、响应缓存，以及组合三者的目录操作。

pub mod cache;
pub mod catalog;
pub mod client;
pub mod models;

pub use catalog::Catalog;
