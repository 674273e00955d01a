//! tunnel-http library
//!
//! Option handling and process wiring for the tunnel-http binary. The DNS
//! and WireGuard layers live in the `tunnel-dns` and `tunnel-wg` crates.

pub mod app;
pub mod config;
pub mod proxy;
