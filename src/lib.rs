//! Real-time synchronization core for the itinerary planner.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! UI action ─► MutationCoordinator ─► MutationSink (REST)
//!                    ▲                      │
//!                    │ apply_remote         ▼
//! EventEmitter ◄─ TopicRouter ◄─ ConnectionManager ◄─ STOMP / WebSocket
//!                                           ▲
//!                 RevisionTracker ─► HistoryApi (REST)
//! ```
//!
//! - [`services::connection::ConnectionManager`] owns one STOMP session per
//!   resource (itinerary) id: deduplicated, throttled, timed-out connects and
//!   bounded automatic reconnection.
//! - [`services::router::TopicRouter`] subscribes the resource's topics and
//!   turns `MESSAGE` frames into typed [`net::types::InboundMessage`]s.
//! - [`services::mutation::MutationCoordinator`] applies reorders locally and
//!   reconciles them against the server.
//! - [`services::history::RevisionTracker`] derives undo/redo availability
//!   from the server-held revision list.
//! - [`events::EventEmitter`] fans events out to UI listeners.

pub mod config;
pub mod events;
pub mod net;
pub mod services;

pub use config::{ConfigError, ReconnectPolicy, SyncConfig};
pub use events::{EventEmitter, EventStream, ListenerId};
pub use net::api::{ApiClient, ApiError};
pub use net::transport::{Connector, Link, LinkEvent, TransportError, WsConnector};
pub use net::types::{
    ConnectionState, DayOrder, ErrorCode, InboundMessage, MessageKind, Revision, SyncEvent, Topic,
};
pub use services::connection::{ConnectionError, ConnectionManager, ProtocolError};
pub use services::history::{
    HistoryApi, HistoryCommand, HistoryError, HistoryEvent, HistoryOutcome, KeyCombo, RevisionPointer,
    RevisionTracker, SkipReason,
};
pub use services::mutation::{
    ChangeStatus, MutationCoordinator, MutationError, MutationEvent, MutationSink, OptimisticChange,
    RemoteOutcome,
};
pub use services::router::{ParseError, TopicRouter};
