//! Live model conversation
//!
//! Wire protocol, streaming transport and the session that ties them to
//! the audio devices.

pub mod protocol;
mod session;
pub mod transport;

pub use protocol::{ClientMessage, ServerEvent, Setup, parse_server_message};
pub use session::{
    ScheduledBuffer, Session, SessionConfig, SessionController, SessionState, SessionStatus,
};
pub use transport::{Connection, ConnectionPeer, Connector, TransportEvent, WebSocketConnector};
