//! 请求保护核心：熔断器注册表、降级策略、多策略限流器与保护网关

pub mod circuit_breaker;
pub mod fallback;
pub mod gateway;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreakerListener, CircuitBreakerRegistry, LoggingListener, MetricsListener,
};
pub use fallback::{CachedSnapshotFallback, CallOutcome, Fallback, OutcomeSource, StaticFallback};
pub use gateway::{GatewayRequest, GatewayResponse, ProtectionGateway};
pub use rate_limiter::{
    LimitKeys, LoadSample, LoadSignal, RateLimiter, StaticLoadSignal, StoreLoadSignal,
    BLACKLIST_RETRY_AFTER_SECS,
};
