//! Agent 运行：运行器抽象与 ReAct 实现

pub mod react;
pub mod run;

pub use react::{parse_llm_output, PlannerOutput, ReactRunner, ToolCall, DEFAULT_MAX_TURNS, DEFAULT_SYSTEM_PROMPT};
pub use run::{AgentRunner, RunHandle, RunItem, RunRequest, Transcript};
