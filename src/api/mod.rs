//! Control API
//!
//! REST endpoints for the pool, the network selection and rotation, plus a
//! WebSocket stream of rotation events.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{ApiServer, AppState};
