pub mod alerts;
pub mod breakers;
pub mod dlq;
pub mod health;
pub mod rate_limits;
