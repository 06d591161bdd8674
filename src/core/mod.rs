//! 核心层：错误类型、引擎组装与优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{engine_materializer, secret_from_config, EngineBuilder};
pub use error::{AgentError, CredentialError, ProviderError, SessionError};
pub use shutdown::{
    CredentialCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SweeperCleanup,
};
