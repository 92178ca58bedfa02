pub mod api_observability;
pub mod app_config;
pub mod dead_letter;
pub mod monitor;
pub mod rate_limit;
pub mod store;

pub use api_observability::*;
pub use app_config::*;
pub use dead_letter::*;
pub use monitor::*;
pub use rate_limit::*;
pub use store::*;
