//! biosphere-gateway — HTTP and WebSocket front end for BioSphere 2 sessions
//!
//! Exposes chat, environment state and live session events over Axum. All
//! orchestration happens in `biosphere-core`; this crate only translates.

pub mod auth;
pub mod protocol;
pub mod server;

pub use server::{GatewayServer, GatewayState};
