pub mod bridge;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod state;

pub use bridge::{BridgeSettings, Deadline, StreamingBridge};
pub use error::RelayError;
pub use orchestrator::{ChatOrchestrator, ChatOutcome, OrchestratorSettings};
pub use server::{create_router, run_server};
pub use state::AppState;
