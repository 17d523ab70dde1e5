//! 工具层：能力接口、工作区策略、本地适配器、工具白名单与执行网关

pub mod capability;
pub mod filesystem;
pub mod gateway;
pub mod local;
pub mod policy;
pub mod registry;
pub mod shell;

pub use capability::{
    Capabilities, CommandOutput, FileCapability, HostCommandCapability, NotificationCapability,
    NotificationLevel, ProcessCapability, TerminalCapability,
};
pub use filesystem::LocalFileAdapter;
pub use gateway::{
    GatewayConfig, ToolContext, ToolGateway, ToolOutcome, ToolPayload, ToolResult, WriteMode,
};
pub use local::{LogTerminal, StdoutNotifier};
pub use policy::WorkspacePolicy;
pub use registry::{catalog_json, ToolKind};
pub use shell::LocalProcessAdapter;
