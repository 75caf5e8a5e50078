//! Listening sockets
//!
//! One [`Endpoint`] per worker slot. All endpoints bind the same port with
//! port reuse enabled, so the kernel load-balances accepts across them.

pub mod endpoint;

pub use endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointRef, SocketEndpointFactory, SocketOptions,
};
