//! WebSocket handlers
//!
//! Each connection gets a bounded buffer fed with `try_send`, so a slow client
//! drops events instead of growing memory.

pub mod rotations;

/// Maximum number of messages to buffer per WebSocket connection
pub const WS_BUFFER_SIZE: usize = 256;
