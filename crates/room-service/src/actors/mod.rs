//! Actor model implementation for the room service.
//!
//! ```text
//! RoomActor (one per room, owns the PeerDirectory and Broadcaster)
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: every directory mutation is a message to the room actor
//! - **No engine I/O in the room actor**: the negotiator talks to the media
//!   engine first, then commits the outcome in one message
//! - **Never block on recipients**: events are enqueued with `try_send`; a full
//!   connection mailbox gets the connection closed
//! - **CancellationToken propagation**: connections run on child tokens of the
//!   room's token, so cancelling the room closes every socket
//!
//! # Modules
//!
//! - [`room`] - `RoomActor`, owns room state
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, DeliveryError, EventSink};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{RoomActor, RoomActorHandle};
