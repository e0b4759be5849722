//! # Room Test Utilities
//!
//! Shared test utilities for the room service.
//!
//! This crate provides:
//! - Server test harness (`TestRoomServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRoomServer::spawn().await?;
//!
//!     let response = reqwest::get(format!("{}/peers", server.url())).await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod server_harness;

// Re-export commonly used items
pub use server_harness::*;
