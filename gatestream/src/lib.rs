// GateStream: encrypted sessions between the n3n platform and its device agents
//
// Crate root: module declarations and public re-exports.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod message;
pub mod pending;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use agent::{AgentConnector, AgentHandle};
pub use config::GatewayConfig;
pub use dispatcher::{InboundEvent, RequestHandler, UnknownMethodHandler};
pub use error::{GateStreamError, Result};
pub use gateway::Gateway;
pub use message::{ErrorBody, ProtocolMessage, RemoteResponse};
pub use pending::PendingRequests;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{Role, Session, SessionState};
pub use transport::{ChannelTransport, Transport, WsTransport};
