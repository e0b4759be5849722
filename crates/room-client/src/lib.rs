//! Room Client Library
//!
//! Participant side of the peer presence and media-subscription protocol.
//! A [`Participant`] joins a room, keeps a mirror of every remote peer and
//! the consumers it holds for their producers, and converges that mirror to
//! exactly one consumer per remote producer no matter how the signaling
//! events and the `/peers` snapshot interleave.
//!
//! # Architecture
//!
//! ```text
//! participant.rs -> signaling.rs  (event stream)
//!                -> actor.rs -> reconciler.rs  (single writer, pure state)
//!                           \-> api.rs  (negotiation calls)
//! ```
//!
//! # Modules
//!
//! - `actor` - Reconciler actor and its handle
//! - `api` - Negotiation API trait, HTTP implementation and mock
//! - `config` - Client configuration from environment
//! - `errors` - Error taxonomy mirroring the server's
//! - `participant` - Join sequence and public facade
//! - `reconciler` - Subscription reconciliation state machine
//! - `signaling` - WebSocket event stream

pub mod actor;
pub mod api;
pub mod config;
pub mod errors;
pub mod participant;
pub mod reconciler;
pub mod signaling;

pub use actor::{ReconcilerActor, ReconcilerHandle};
pub use api::{HttpRoomApi, RoomApi};
pub use config::ClientConfig;
pub use errors::ClientError;
pub use participant::{Participant, ParticipantOptions};
pub use reconciler::{Command, MirrorView, Reconciler};
pub use signaling::SignalingStream;
