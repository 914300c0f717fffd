//! porthole-core: the session protocol behind the porthole web terminal.
//!
//! Responsibilities:
//! - full-duplex relay between a client terminal and a remote exec stream
//! - inline control messages (resize, heartbeat) sharing the data channel
//! - bounded reconnection with exponential backoff
//! - paced chunking for oversized pastes
//! - out-of-band file delivery with progress reporting
//! - TTL memoization of target existence checks
//!
//! Everything that talks to the outside world (the exec transport, target
//! discovery, audit recording, bulk transfer) sits behind the traits in
//! [`exec`]; binaries plug in their own implementations.

pub mod cache;
pub mod chunk;
pub mod error;
pub mod exec;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod upload;

pub use error::{Error, Result};
pub use exec::{Geometry, TargetRef};
