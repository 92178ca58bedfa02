//! 领域模型
//!
//! 任务、死信条目、熔断与限流记录、告警与事件，以及存储和时钟端口。

pub mod circuit;
pub mod clock;
pub mod entities;
pub mod events;
pub mod ports;
pub mod rate_limit;
pub mod value_objects;

pub use bulwark_errors::{BulwarkError, BulwarkResult};
pub use circuit::*;
pub use clock::{Clock, SystemClock};
pub use entities::*;
pub use events::*;
pub use ports::*;
pub use rate_limit::*;
pub use value_objects::*;
