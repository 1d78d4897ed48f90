//! BOTCHA HTTP server.
//!
//! Exposes the [`botcha`] challenge, token and TAP services over axum. The
//! binary in `main.rs` wires [`ServerConfig`] and a [`botcha::store::MemoryStore`]
//! into [`router`]; tests drive the same router in-process.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use botcha::store::MemoryStore;
//! use botcha_server::{AppState, ServerConfig, router};
//!
//! # fn example() -> botcha_server::error::Result<()> {
//! let config = ServerConfig::load()?;
//! let state = AppState::new(&config, Arc::new(MemoryStore::new()))?;
//! let app = router(Arc::new(state));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and rsa"
)]

pub mod api;
pub mod config;
pub mod error;
pub mod observability;

pub use api::{AppState, SharedState, router};
pub use config::ServerConfig;
