//! 工具层：函数工具（ask_user / render_chart）、注册表与每轮工具箱

pub mod ask_user;
pub mod registry;
pub mod render_chart;
pub mod toolbox;

pub use ask_user::AskUserTool;
pub use registry::{Tool, ToolRegistry, TurnContext};
pub use render_chart::RenderChartTool;
pub use toolbox::Toolbox;
