use thiserror::Error;

#[derive(Debug, Error)]
pub enum BulwarkError {
    #[error("熔断器已打开: {service}，{retry_after_secs}秒后重试")]
    CircuitOpen {
        service: String,
        retry_after_secs: u64,
    },
    #[error("下游服务调用失败: {service} - {message}")]
    Downstream { service: String, message: String },
    #[error("超出限流: {identifier} ({config})，{retry_after_secs}秒后重试")]
    RateLimitExceeded {
        identifier: String,
        config: String,
        retry_after_secs: u64,
    },
    #[error("任务永久失败: {task_id}，已尝试{attempts}次 - {last_error}")]
    TaskPermanentFailure {
        task_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("服务降级中: {service}")]
    ServiceDegraded {
        service: String,
        retry_after_secs: u64,
    },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("未知的限流配置: {name}")]
    UnknownRateLimitConfig { name: String },
    #[error("未知的熔断器: {name}")]
    UnknownCircuitBreaker { name: String },
    #[error("存储错误: {0}")]
    Store(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("通知发送失败: {channel} - {message}")]
    Notification { channel: String, message: String },
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BulwarkResult<T> = Result<T, BulwarkError>;

impl BulwarkError {
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn unknown_rate_limit_config<S: Into<String>>(name: S) -> Self {
        Self::UnknownRateLimitConfig { name: name.into() }
    }
    pub fn unknown_circuit_breaker<S: Into<String>>(name: S) -> Self {
        Self::UnknownCircuitBreaker { name: name.into() }
    }
    pub fn downstream<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Downstream {
            service: service.into(),
            message: message.into(),
        }
    }
    pub fn notification<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Notification {
            channel: channel.into(),
            message: message.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn timeout_error<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// 熔断器打开时下游从未被调用
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BulwarkError::CircuitOpen { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BulwarkError::Downstream { .. }
                | BulwarkError::CircuitOpen { .. }
                | BulwarkError::RateLimitExceeded { .. }
                | BulwarkError::ServiceDegraded { .. }
                | BulwarkError::Store(_)
                | BulwarkError::Timeout(_)
        )
    }

    /// 客户端应等待的秒数，仅对带重试提示的错误有值
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BulwarkError::CircuitOpen {
                retry_after_secs, ..
            }
            | BulwarkError::RateLimitExceeded {
                retry_after_secs, ..
            }
            | BulwarkError::ServiceDegraded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn user_message(&self) -> &str {
        match self {
            BulwarkError::CircuitOpen { .. } => "依赖服务暂不可用，请稍后重试",
            BulwarkError::ServiceDegraded { .. } => "服务降级中，请稍后重试",
            BulwarkError::RateLimitExceeded { .. } => "请求过于频繁，请稍后重试",
            BulwarkError::TaskNotFound { .. } => "请求的任务不存在",
            BulwarkError::UnknownRateLimitConfig { .. } => "请求的限流配置不存在",
            BulwarkError::UnknownCircuitBreaker { .. } => "请求的熔断器不存在",
            BulwarkError::Validation(_) => "输入数据验证失败",
            BulwarkError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for BulwarkError {
    fn from(err: serde_json::Error) -> Self {
        BulwarkError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BulwarkError {
    fn from(err: anyhow::Error) -> Self {
        BulwarkError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
