//! Loopback code execution server.
//!
//! A client sends one JSON request per WebSocket connection. The server
//! asks the operator to approve unseen client tokens, writes the code into
//! a throwaway workspace, runs the language's build and run steps, and
//! streams tagged output frames back before closing the connection.

pub mod client;
pub mod config;
pub mod error;
pub mod languages;
pub mod process;
pub mod protocol;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod trust;
pub mod workspace;
pub mod ws_server;

pub use config::ServerConfig;
pub use error::{ExecError, FailureKind, StepFailure};
pub use languages::{HandlerRegistry, LanguageHandler, StepCommand};
pub use protocol::{Channel, ExecutionRequest, OutputFrame};
pub use session::{ExecutionSession, Phase};
pub use state::AppState;
pub use trust::{ApprovalRequest, TrustGate};
