//! Tapline - 工具型分析 Agent 的流式编排引擎
//!
//! 模块划分：
//! - **agent**: 模型运行器抽象与 ReAct 实现
//! - **ask_user**: 结构化提问的挂起 / 提交存储
//! - **chat**: 调用方协作者（事件记录、对话存储）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭
//! - **credentials**: 每轮凭据落盘与删除
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化）
//! - **properties**: 账号下分析属性 / 站点的一次性列表
//! - **providers**: 工具服务窄接口与适配器（MCP stdio、前缀、压缩）
//! - **session**: 每轮会话资源管理与空闲清扫
//! - **stream**: 事件多路合并与单轮驱动
//! - **tools**: 函数工具（ask_user、render_chart）与每轮工具箱
//! - **translate**: 推理摘要翻译

pub mod agent;
pub mod ask_user;
pub mod chat;
pub mod config;
pub mod core;
pub mod credentials;
pub mod llm;
pub mod observability;
pub mod properties;
pub mod providers;
pub mod session;
pub mod stream;
pub mod tools;
pub mod translate;

pub use stream::{StreamEvent, TurnEngine, TurnRequest, TurnStream};
