use crate::*;

#[test]
fn test_bulwark_error_display() {
    let err = BulwarkError::CircuitOpen {
        service: "analytics".to_string(),
        retry_after_secs: 42,
    };
    assert_eq!(err.to_string(), "熔断器已打开: analytics，42秒后重试");

    let err = BulwarkError::TaskNotFound {
        id: "abc".to_string(),
    };
    assert_eq!(err.to_string(), "任务未找到: abc");

    let err = BulwarkError::Store("connection reset".to_string());
    assert_eq!(err.to_string(), "存储错误: connection reset");

    let err = BulwarkError::downstream("database", "deadlock");
    assert_eq!(err.to_string(), "下游服务调用失败: database - deadlock");
}

#[test]
fn test_retry_after_hint() {
    let limited = BulwarkError::RateLimitExceeded {
        identifier: "user:1".to_string(),
        config: "api".to_string(),
        retry_after_secs: 12,
    };
    assert_eq!(limited.retry_after_secs(), Some(12));
    assert!(limited.is_retryable());

    let degraded = BulwarkError::ServiceDegraded {
        service: "ai_assistant".to_string(),
        retry_after_secs: 30,
    };
    assert_eq!(degraded.retry_after_secs(), Some(30));

    assert_eq!(BulwarkError::task_not_found("t").retry_after_secs(), None);
}

#[test]
fn test_is_retryable() {
    assert!(BulwarkError::store_error("timeout").is_retryable());
    assert!(BulwarkError::timeout_error("slow").is_retryable());
    assert!(BulwarkError::downstream("analytics", "503").is_retryable());

    assert!(!BulwarkError::validation_error("bad").is_retryable());
    assert!(!BulwarkError::config_error("bad").is_retryable());
    assert!(!BulwarkError::TaskPermanentFailure {
        task_id: "t".to_string(),
        attempts: 3,
        last_error: "boom".to_string(),
    }
    .is_retryable());
}

#[test]
fn test_is_circuit_open() {
    let open = BulwarkError::CircuitOpen {
        service: "database".to_string(),
        retry_after_secs: 1,
    };
    assert!(open.is_circuit_open());
    assert!(!BulwarkError::downstream("database", "x").is_circuit_open());
}

#[test]
fn test_user_message() {
    assert_eq!(
        BulwarkError::task_not_found("t").user_message(),
        "请求的任务不存在"
    );
    assert_eq!(
        BulwarkError::RateLimitExceeded {
            identifier: "u".to_string(),
            config: "api".to_string(),
            retry_after_secs: 1,
        }
        .user_message(),
        "请求过于频繁，请稍后重试"
    );
    assert_eq!(
        BulwarkError::Internal("x".to_string()).user_message(),
        "系统繁忙，请稍后重试"
    );
}

#[test]
fn test_from_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: BulwarkError = json_err.into();
    assert!(matches!(err, BulwarkError::Serialization(_)));

    let err: BulwarkError = anyhow::anyhow!("boom").into();
    assert!(matches!(err, BulwarkError::Internal(msg) if msg == "boom"));
}
