//! Shared helpers for protocol-level integration tests: an in-process node
//! plus a thin line-oriented client over a real TCP socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use spool_server::{start_node, NodeConfig, NodeHandle};

/// Per-operation timeout so a broken server fails the test instead of
/// hanging it.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn spawn_node(config: NodeConfig) -> NodeHandle {
    start_node(config).await.expect("start node")
}

pub fn disk_config(dir: &tempfile::TempDir) -> NodeConfig {
    NodeConfig {
        data_dir: Some(dir.path().to_path_buf()),
        sync_policy: spool_store::SyncPolicy::Always,
        ..NodeConfig::default()
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect");
        let (read_half, write_half) = stream.into_split();
        Client {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, line: &str) {
        let framed = format!("{line}\r\n");
        tokio::time::timeout(IO_TIMEOUT, self.writer.write_all(framed.as_bytes()))
            .await
            .expect("write timed out")
            .expect("write");
    }

    /// Reads one CRLF-terminated line, without the terminator. `None` on EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .expect("read");
        if n == 0 {
            return None;
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    pub async fn expect_line(&mut self, expected: &str) {
        let got = self.read_line().await;
        assert_eq!(got.as_deref(), Some(expected));
    }

    pub async fn expect_eof(&mut self) {
        assert_eq!(self.read_line().await, None, "expected disconnect");
    }

    /// `set` round trip; returns the response line (`STORED`/`NOT_STORED`).
    pub async fn set(&mut self, queue: &str, expiry: u64, data: &[u8]) -> String {
        self.send(&format!("set {queue} 0 {expiry} {}", data.len()))
            .await;
        let mut payload = data.to_vec();
        payload.extend_from_slice(b"\r\n");
        tokio::time::timeout(IO_TIMEOUT, self.writer.write_all(&payload))
            .await
            .expect("write timed out")
            .expect("write");
        self.read_line().await.expect("set response")
    }

    /// Issues a get-style command and parses the `VALUE`/`END` reply.
    /// `None` for an empty answer; panics on any other response.
    pub async fn get_value(&mut self, command: &str) -> Option<Vec<u8>> {
        self.send(command).await;
        self.read_value_frame().await
    }

    /// Parses one `VALUE <q> <flags> <len>` + data + `END`, or a bare `END`.
    pub async fn read_value_frame(&mut self) -> Option<Vec<u8>> {
        let header = self.read_line().await.expect("value header");
        if header == "END" {
            return None;
        }
        let data = self.read_value_data(&header).await;
        self.expect_line("END").await;
        Some(data)
    }

    /// Reads a `monitor` stream: any number of `VALUE` frames closed by `END`.
    pub async fn read_stream_values(&mut self) -> Vec<Vec<u8>> {
        let mut values = Vec::new();
        loop {
            let header = self.read_line().await.expect("stream frame");
            if header == "END" {
                return values;
            }
            values.push(self.read_value_data(&header).await);
        }
    }

    async fn read_value_data(&mut self, header: &str) -> Vec<u8> {
        let len: usize = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.rsplit(' ').next())
            .and_then(|len| len.parse().ok())
            .unwrap_or_else(|| panic!("unexpected response {header:?}"));
        let mut data = vec![0u8; len + 2];
        tokio::time::timeout(IO_TIMEOUT, self.reader.read_exact(&mut data))
            .await
            .expect("read timed out")
            .expect("read data");
        data.truncate(len);
        data
    }
}
