//! 获取流程的统一错误类型。
//!
//! 会话层与远程客户端产生的错误原样传递给下载队列，由队列作为任务的终止失败事件上报。

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 解包失败发生在哪个阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapStage {
    KeyDerivation,
    Archive,
    Document,
}

impl fmt::Display for UnwrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnwrapStage::KeyDerivation => "key derivation",
            UnwrapStage::Archive => "archive unwrap",
            UnwrapStage::Document => "document unwrap",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("not authenticated, please login first")]
    NotAuthenticated,
    #[error("session expired, please login again")]
    SessionExpired,
    #[error("remote request failed: {message}")]
    RemoteRequestFailed { status: Option<u16>, message: String },
    #[error("acquisition already in progress for item {0}")]
    AlreadyInProgress(String),
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("{stage} failed: {message}")]
    UnwrapFailed { stage: UnwrapStage, message: String },
    #[error("no lending branch available for item {0}")]
    NoLoanAvailable(String),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("corrupt file {path}: {message}")]
    CorruptFile { path: PathBuf, message: String },
}

pub type AcquireResult<T> = Result<T, AcquireError>;

impl AcquireError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AcquireError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unwrap_failed(stage: UnwrapStage, message: impl Into<String>) -> Self {
        AcquireError::UnwrapFailed {
            stage,
            message: message.into(),
        }
    }

    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        AcquireError::RemoteRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// 远端返回 401。
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AcquireError::RemoteRequestFailed {
                status: Some(401),
                ..
            }
        )
    }

    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AcquireError::NotAuthenticated | AcquireError::SessionExpired
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquireError::Cancelled)
    }
}
