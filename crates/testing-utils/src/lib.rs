//! # Bulwark Testing Utils
//!
//! 工作区共享的测试工具：手动时钟、测试数据构造器、告警通道替身和追踪初始化。
//!
//! ```toml
//! [dev-dependencies]
//! bulwark-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod channels;
pub mod clock;
pub mod helpers;

pub use builders::*;
pub use channels::*;
pub use clock::*;
pub use helpers::*;
