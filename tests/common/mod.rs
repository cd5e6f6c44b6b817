//! Shared helper for the integration tests: serve a fake ESI on a
//! loopback listener and hand back its base URL.

use axum::Router;

pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve fake esi");
    });
    format!("http://{addr}")
}
