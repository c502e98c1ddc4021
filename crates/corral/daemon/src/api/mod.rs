//! HTTP interface of the daemon

pub mod rest;

pub use rest::router::create_router;
