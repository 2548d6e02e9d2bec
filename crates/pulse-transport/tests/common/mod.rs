//! Shared fixtures for transport integration tests.

#![allow(dead_code)]

pub mod mock_rest;
pub mod mock_ws;

use std::net::SocketAddr;

/// An address nothing is listening on.
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
