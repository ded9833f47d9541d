pub mod schema;
pub mod traits;
pub mod workspace;

#[allow(unused_imports)]
pub use schema::{
    AgentDefaults, AgentsConfig, Config, GatewayConfig, ProviderConfig, CONFIG_FILE_NAME,
    DEFAULT_MODEL, DEFAULT_PROVIDER, NVIDIA_API_BASE,
};
pub use traits::Workspace;
pub use workspace::{init_workspace, FileWorkspace};
