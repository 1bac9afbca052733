//! pgmirror is a wire-compatible postgres proxy that splits traffic by
//! statement class: reads go to a single replica endpoint, writes fan out
//! to every configured primary under a coordinated per-writer transaction.
//! Clients see one logical server; the primaries stay consistent by
//! construction on the common write path.

#[macro_use]
extern crate derive_new;

pub mod auth;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod messages;
pub mod router;
pub mod server;
pub mod session;
