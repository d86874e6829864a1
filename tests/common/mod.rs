use axum::{Router, routing::get};
use dnsgate::config::StatePaths;
use dnsgate::core::Core;
use dnsgate::events::RecordingBus;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

/// Build a core rooted in a throwaway state dir with a recording event bus.
pub fn test_core(spr_enabled: bool) -> (TempDir, Arc<Core>, Arc<RecordingBus>) {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(RecordingBus::new());
    let core = Core::open(StatePaths::new(dir.path()), spr_enabled, bus.clone()).unwrap();
    (dir, core, bus)
}

/// Serve static blocklist bodies over a loopback HTTP listener so download
/// tests never touch the network.
pub async fn serve_lists(routes: &[(&'static str, &str)]) -> SocketAddr {
    let mut router = Router::new();
    for (path, body) in routes {
        let body = body.to_string();
        router = router.route(path, get(move || async move { body }));
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
