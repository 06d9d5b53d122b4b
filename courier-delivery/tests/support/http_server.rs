//! One-shot HTTP responder for endpoint and webhook scenarios.
#![allow(dead_code)]

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

/// A request as the responder saw it.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub head: String,
    pub body: String,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Answers the first request with `status` and `body`, then stops listening.
pub async fn respond_once(status: u16, body: &'static str) -> (String, JoinHandle<ReceivedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/inbound", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let read = stream.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..read]);
            let text = String::from_utf8_lossy(&received).into_owned();
            let Some((head, request_body)) = text.split_once("\r\n\r\n") else {
                assert!(read > 0, "connection closed before the request head");
                continue;
            };

            let request = ReceivedRequest {
                head: head.to_string(),
                body: request_body.to_string(),
            };
            let length = request
                .header("content-length")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(0);
            if request.body.len() < length && read > 0 {
                continue;
            }

            let response = format!(
                "HTTP/1.1 {status} Status\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            return request;
        }
    });

    (url, handle)
}
