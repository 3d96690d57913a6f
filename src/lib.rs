//! HTTP gateway for remote code sandboxes.
//!
//! Each endpoint maps to one SDK call on a sandbox handle. Handles and their
//! scratch directories live in an in-memory registry keyed by the sandbox id
//! the SDK hands out.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod sdk;
pub mod state;
