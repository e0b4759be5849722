//! Common utilities and types shared across the room service and its clients.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes and media enums
pub mod types;

/// Module for the signaling event stream messages
pub mod events;

/// Module for HTTP request and response bodies
pub mod protocol;

/// Module for the JSON error envelope
pub mod error;
