//! Helpers shared by tests that need a live HTTP peer.

use std::net::SocketAddr;

use axum::Router;

/// Serve `router` on an ephemeral localhost port and return its address.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
