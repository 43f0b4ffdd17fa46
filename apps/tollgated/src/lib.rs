//! The tollgated daemon: a reverse proxy that answers unauthenticated
//! requests with Lightning invoice challenges and forwards paid ones.
//!
//! The binary in `main.rs` is a thin bootstrap; everything it wires
//! together lives here so the integration tests can drive the same
//! code paths in-process.

pub mod auth;
pub mod config;
pub mod freebie;
pub mod lnd;
pub mod proxy;
pub mod server;
pub mod tor;
