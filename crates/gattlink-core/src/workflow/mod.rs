//! 工作流模块
//!
//! 提供高层 API：扫描、连接、收发消息都通过 [`SessionFacade`] 完成

pub mod facade;

pub use facade::{LinkStatus, SessionFacade};
