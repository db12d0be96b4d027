//! 登录凭据与会话。

pub mod credential_store;
pub mod session;

pub use session::{SessionManager, ValidCredential};
