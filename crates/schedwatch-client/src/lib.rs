//! Live mirror of a job scheduler's resources over a JSON-RPC WebSocket.
//!
//! [`Session::spawn`] opens the channel and returns a [`SessionHandle`]; the
//! UI reads [`EntityStore`] through the handle and never touches the network.

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod router;
pub mod session;
pub mod store;

pub use api::{InvalidateRequest, OutputStream, ViewFileRequest};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::ConnectionState;
pub use error::{CallError, ClientError, ConnectError};
pub use session::{CallTimeout, Notice, NoticeLevel, PendingCall, Session, SessionHandle};
pub use store::{EntityStore, ResourceUpdate, StateCounters, StoreWarning};
