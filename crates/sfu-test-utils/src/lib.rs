//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU coordinator.
//!
//! ## Modules
//!
//! - `mock_media` - Media engine with fault injection and call counting
//! - `test_peer` - Drives one peer session the way a WebSocket client would
//! - `fixtures` - Coordinator harness and canned client payloads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockMediaEngine::builder()
//!         .fail(MediaOp::Consume, Fault::Reject("no decoder".into()))
//!         .build();
//!     let coordinator = TestCoordinator::with_engine(engine);
//!
//!     let mut alice = coordinator.connect();
//!     alice.join("room-1").await;
//!     let flow = alice.publish(MediaKind::Audio).await;
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod test_peer;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_media::*;
pub use test_peer::*;
