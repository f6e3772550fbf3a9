//! Shared test client for the subscriber protocol.

#![allow(dead_code)]

use depthcast::network::protocol::{self, ClientMessage};
use serde_json::Value;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_LIMIT: usize = 64 * 1024 * 1024;

/// A raw subscriber: writes framed client records, reads server records into
/// a background-drained queue so slow assertions never stall the server.
pub struct TestClient {
    write: OwnedWriteHalf,
    records: mpsc::UnboundedReceiver<Value>,
    reader: JoinHandle<()>,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to broadcaster");
        let (mut read, write) = stream.into_split();
        let (tx, records) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Ok(payload) = protocol::read_frame(&mut read, READ_LIMIT).await {
                let value: Value = match serde_json::from_slice(&payload) {
                    Ok(value) => value,
                    Err(_) => break,
                };
                if tx.send(value).is_err() {
                    break;
                }
            }
        });
        Self {
            write,
            records,
            reader,
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        let frame = protocol::encode_client(message).expect("encode client record");
        protocol::write_frame(&mut self.write, &frame)
            .await
            .expect("write client record");
    }

    /// Write an arbitrary payload inside a valid length frame.
    pub async fn send_raw(&mut self, payload: &[u8]) {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        protocol::write_frame(&mut self.write, &bytes::Bytes::from(framed))
            .await
            .expect("write raw record");
    }

    /// Next record, bounded by a generous timeout.
    pub async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(10), self.records.recv())
            .await
            .expect("record within ten seconds")
            .expect("connection still open")
    }

    /// Skip records until one with the given `type` tag arrives.
    pub async fn next_of_type(&mut self, tag: &str) -> Value {
        loop {
            let record = self.next().await;
            if record["type"] == tag {
                return record;
            }
        }
    }

    /// Whether the server has closed the connection, observed as the reader
    /// finishing with no records left.
    pub async fn closed(mut self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            tokio::select! {
                record = self.records.recv() => {
                    if record.is_none() {
                        let _ = self.reader.await;
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Run the identification handshake; returns the welcome record.
    pub async fn identify(&mut self, name: &str) -> Value {
        self.next_of_type("identify").await;
        self.send(&ClientMessage::Identify {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            platform: "test".to_string(),
            capabilities: vec!["frames".to_string()],
        })
        .await;
        self.next_of_type("welcome").await
    }
}
