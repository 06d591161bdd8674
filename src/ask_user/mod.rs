//! 人在回路：Agent 提出结构化问题组，挂起等待外部提交回答（有超时）

pub mod store;

pub use store::{AskUserStore, Question, QuestionGroup, QuestionType, WaitOutcome, DEFAULT_ASK_USER_TIMEOUT};
