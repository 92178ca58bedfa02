//! 存储适配器
//!
//! 内存实现用于单实例部署和测试，Redis实现用于多实例共享状态。

pub mod in_memory_store;
pub mod redis_store;
pub mod store_factory;

pub use in_memory_store::InMemoryStore;
pub use redis_store::RedisStore;
pub use store_factory::StoreFactory;
