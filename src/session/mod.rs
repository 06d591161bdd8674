//! 每轮会话资源：凭据落盘 + 工具服务集合的创建、进入与只执行一次的回收

pub mod manager;
pub mod set;
pub mod spec;

pub use manager::{
    SessionManager, SessionSettings, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};
pub use set::ProviderSet;
pub use spec::{derive_prefix, Capability, McpProviderFactory, ProviderFactory, ProviderSpec};
