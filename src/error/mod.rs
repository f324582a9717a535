//! 服务发现客户端错误定义
//!
//! 按组件划分错误类型：传输层、实例选择、自注册和配置，
//! 门面层通过 [`DiscoveryError`] 统一对外暴露。

use http::StatusCode;
use thiserror::Error;

/// 注册中心传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 网络故障（连接失败、请求超时等），可重试
    #[error("network failure: {0}")]
    Network(String),

    /// 后端返回非成功状态码
    #[error("backend returned status {status}: {message}")]
    Backend { status: StatusCode, message: String },

    /// 响应无法解析，不可重试
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// 创建网络错误
    pub fn network(msg: impl Into<String>) -> Self {
        TransportError::Network(msg.into())
    }

    /// 创建后端错误
    pub fn backend(status: StatusCode, message: impl Into<String>) -> Self {
        TransportError::Backend {
            status,
            message: message.into(),
        }
    }

    /// 创建响应格式错误
    pub fn malformed(msg: impl Into<String>) -> Self {
        TransportError::Malformed(msg.into())
    }

    /// 是否可重试
    ///
    /// 网络错误和 5xx 可重试；4xx 与格式错误重试也不会有不同结果
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Backend { status, .. } => status.is_server_error(),
            TransportError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::backend(status, err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// 实例选择错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// 缓存中没有该服务（从未监听，或后端没有任何注册）
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// 服务存在但没有健康实例
    #[error("no healthy instance for service: {0}")]
    NoHealthyInstance(String),
}

/// 自注册错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// 后端明确拒绝注册（4xx），不会重试
    #[error("registration rejected by backend: {0}")]
    BackendRejected(TransportError),

    /// 重试次数耗尽，实例无法被发现
    #[error("registration retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        attempts: usize,
        last_error: TransportError,
    },

    /// 尚未注册任何实例
    #[error("no instance registered")]
    NotRegistered,

    /// 注册重试期间被注销或关闭打断
    #[error("registration cancelled")]
    Cancelled,
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 服务发现客户端统一错误
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 服务名非法（空字符串）
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),
}

/// 服务发现客户端结果类型
pub type Result<T> = std::result::Result<T, DiscoveryError>;
