//! 工具箱：注册表、Secure Command Gate、Shell / 文件 / HTTP / 搜索 / Echo 工具

pub mod echo;
pub mod filesystem;
pub mod gate;
pub mod http;
pub mod registry;
pub mod search;
pub mod shell;

pub use echo::EchoTool;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use gate::{CommandOutcome, SecureCommandGate};
pub use http::HttpTool;
pub use registry::{tool_call_schema_json, Tool, ToolRegistry};
pub use search::WebSearchTool;
pub use shell::ShellTool;
