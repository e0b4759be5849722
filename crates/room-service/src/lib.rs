//! Room Service Library
//!
//! Server side of the peer presence and media-subscription protocol:
//!
//! - Peer directory: who is in the room, with their transports, producers
//!   and consumers
//! - Signaling broadcaster: `peer-join`, `peer-left` and `new-producer`
//!   events to every other connected peer
//! - Negotiation sequencer: the HTTP calls a peer uses to create transports,
//!   publish and subscribe
//! - Media engine adapter: the narrow surface the room needs from an SFU,
//!   with an in-process loopback implementation
//!
//! # Architecture
//!
//! ```text
//! routes.rs -> handlers/*.rs -> negotiation.rs -> actors/room.rs -> directory.rs
//!                                             \-> engine/*.rs
//! ```
//!
//! # Modules
//!
//! - `actors` - Room and connection actors
//! - `broadcaster` - Event fan-out
//! - `config` - Service configuration from environment
//! - `directory` - Peer registry
//! - `engine` - Media engine adapter
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP and WebSocket handlers
//! - `middleware` - HTTP metrics
//! - `negotiation` - Request/response negotiation
//! - `observability` - Metrics and health
//! - `routes` - Axum router setup

pub mod actors;
pub mod broadcaster;
pub mod config;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod negotiation;
pub mod observability;
pub mod routes;
