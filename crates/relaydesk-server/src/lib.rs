pub mod assistant;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod fanout;
pub mod handlers;
pub mod health;
pub mod locks;
pub mod metrics;
pub mod presence;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod wire;

pub use assistant::{Assistant, AssistantError, CannedAssistant};
pub use config::{ServerSettings, SettingsError};
pub use coordinator::{HandoffCoordinator, HandoffOutcome};
pub use server::{build_router, start, AppState, ServerHandle};
