//! 调用方协作者：对话存储与事件记录

pub mod recorder;
pub mod store;

pub use recorder::TurnRecorder;
pub use store::{
    AskUserAnswer, ConversationRecord, ConversationStore, InMemoryConversationStore, StoredMessage,
    ToolCallRecord,
};
