//! 事件分发模块
//!
//! 引擎执行上下文与观察者上下文之间的桥：节流、换算百分比、
//! 保序投递（同任务内有序，跨任务可交错）

pub mod dispatcher;
pub mod throttle;
pub mod types;

pub use dispatcher::{EventDispatcher, ProgressCallback};
pub use throttle::StepThrottler;
pub use types::{ProgressUpdate, TransferEvent};
