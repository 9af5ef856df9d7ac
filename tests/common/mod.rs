#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(dead_code)]

/// Find an available port for testing (returns port > 1024)
pub fn get_available_port() -> u16 {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to random port");
    let port = listener.local_addr().expect("failed to get local addr").port();

    assert!(port > 1024, "assigned port {port} should be > 1024");
    port
}

/// Wait for server to be ready on the given port.
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    use tokio::time::{Duration, sleep};

    for attempt in 1..=max_attempts {
        if tokio::net::TcpStream::connect(format!("localhost:{port}")).await.is_ok() {
            return true;
        }
        if attempt % 10 == 0 {
            eprintln!("still waiting for server on port {port} (attempt {attempt}/{max_attempts})");
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

pub fn get_test_url(port: u16) -> String {
    format!("http://localhost:{port}")
}
