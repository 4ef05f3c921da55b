//! Liveness and introspection HTTP endpoints

use podnat_firewall::SharedRuleBook;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Minimal HTTP server for Kubernetes probes and rule introspection
pub struct Server {
    port: u16,
    book: SharedRuleBook,
}

impl Server {
    pub fn new(port: u16, book: SharedRuleBook) -> Self {
        Self { port, book }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(&addr).await?;

        info!("http server listening on http://{}", addr);

        serve(listener, self.book.clone()).await
    }
}

async fn serve(listener: TcpListener, book: SharedRuleBook) -> anyhow::Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;
        let book = book.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_request(socket, book).await {
                debug!("http request error: {}", e);
            }
        });
    }
}

async fn handle_request(socket: TcpStream, book: SharedRuleBook) -> anyhow::Result<()> {
    let mut buf = vec![0; 1024];

    socket.readable().await?;
    let n = socket.try_read(&mut buf)?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    debug!("http request: {}", path);

    let (status_code, content_type, body) = match path {
        "/ping" | "/ready" | "/healthz" => (200, "text/plain", "pong\n".to_string()),
        "/entries/list" => {
            let entries = {
                let book = book.lock().await;
                serde_json::to_string(&*book)?
            };
            (200, "application/json", entries)
        }
        _ => (404, "text/plain", "not found\n".to_string()),
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        status_text(status_code),
        content_type,
        body.len(),
        body
    );
    socket.try_write(response.as_bytes())?;

    Ok(())
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        404 => "Not Found",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podnat_firewall::RuleBook;
    use std::sync::Arc;

    async fn spawn_server() -> (SocketAddr, SharedRuleBook) {
        let book: SharedRuleBook = Arc::new(tokio::sync::Mutex::new(RuleBook::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve_book = book.clone();
        tokio::spawn(async move {
            let _ = serve(listener, serve_book).await;
        });
        (addr, book)
    }

    #[tokio::test]
    async fn liveness_paths_answer_pong() {
        let (addr, _book) = spawn_server().await;
        let client = reqwest::Client::new();

        for path in ["/ping", "/ready", "/healthz"] {
            let response = client
                .get(format!("http://{}{}", addr, path))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.text().await.unwrap(), "pong\n");
        }
    }

    #[tokio::test]
    async fn entries_list_serves_the_book() {
        let (addr, _book) = spawn_server().await;

        let response = reqwest::Client::new()
            .get(format!("http://{}/entries/list", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body.is_object());
    }

    #[tokio::test]
    async fn unknown_paths_return_404() {
        let (addr, _book) = spawn_server().await;

        let response = reqwest::Client::new()
            .get(format!("http://{}/nope", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn status_text_covers_served_codes() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(500), "Unknown");
    }
}
