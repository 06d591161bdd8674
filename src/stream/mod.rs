//! 事件多路合并：原生事件翻译、共享队列与单轮驱动
//!
//! - **events**: 对外事件（NDJSON）与模型原生事件
//! - **queue**: 每轮共享的无界队列与终止哨兵
//! - **turn**: 单轮状态机与调用方事件流

pub mod events;
pub mod queue;
pub mod turn;

pub use events::{translate_run_event, RunEvent, StreamEvent, REASONING_PLACEHOLDER};
pub use queue::{event_queue, EventEmitter, QueueItem};
pub use turn::{
    TurnEngine, TurnPhase, TurnRequest, TurnSettings, TurnStream, DEFAULT_TOOL_RESULT_PREVIEW_CHARS,
};
