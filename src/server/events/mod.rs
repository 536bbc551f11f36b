//! 事件模块
//!
//! - `types.rs`: 进度事件与订阅流消息
//! - `broadcaster.rs`: 按 subject 扇出的广播器
//! - `throttle.rs`: 传输进度事件节流

mod broadcaster;
mod throttle;
mod types;

pub use broadcaster::*;
pub use throttle::*;
pub use types::*;
