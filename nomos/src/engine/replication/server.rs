/*
 * This file is a part of Nomos
*/

//! Accepts inbound replication peers and streams frames to them from
//! whatever cursor they ask for (spec §4.5, server side).

use crate::engine::replication::log::{Cursor, ReplicationLog};
use crate::engine::replication::wire::{
    ReadBinLogAnswer, ReadBinLogRequest, SenderHandshakeRequest,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Idle-poll retry budget: if `read_for` comes back empty but the peer asked
/// for data, give the log a little time to catch up before answering with
/// `size = 0`, bounding idle latency without busy-spinning.
const RETRY_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct ReplicationPeerServer {
    log: Arc<ReplicationLog>,
    own_server_id: u32,
}

impl ReplicationPeerServer {
    pub fn new(log: Arc<ReplicationLog>, own_server_id: u32) -> Self {
        Self { log, own_server_id }
    }

    pub async fn run(
        self: Arc<Self>,
        host: IpAddr,
        port: u16,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        log::info!("replication server listening on {host}:{port}");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.serve_one(stream).await {
                            log::warn!("replication peer {addr} disconnected: {e}");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    log::info!("replication server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_one(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut head = [0u8; 6];
        stream.read_exact(&mut head).await?;
        let handshake = SenderHandshakeRequest::decode_from(&mut &head[..])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if handshake.from_server_id == self.own_server_id {
            log::warn!("rejecting self-connection from server {}", handshake.from_server_id);
            return Ok(());
        }

        stream.write_all(&self.own_server_id.to_le_bytes()).await?;

        loop {
            let mut req_buf = [0u8; 8];
            if stream.read_exact(&mut req_buf).await.is_err() {
                return Ok(());
            }
            let req = ReadBinLogRequest::decode_from(&mut &req_buf[..])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

            let cursor = Cursor {
                segment: req.segment_number,
                offset: req.offset as u64,
            };

            let mut bytes = Vec::new();
            let mut next = cursor;
            for attempt in 0..RETRY_ATTEMPTS {
                let (b, n) = self
                    .log
                    .read_for(handshake.from_server_id, cursor)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                if !b.is_empty() || n.segment != cursor.segment {
                    bytes = b;
                    next = n;
                    break;
                }
                if attempt + 1 < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }

            let answer = ReadBinLogAnswer {
                segment_number: next.segment,
                offset: next.offset as u32,
                size: bytes.len() as u32,
            };
            let mut out = Vec::new();
            answer
                .encode_to(&mut out)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            stream.write_all(&out).await?;
            if !bytes.is_empty() {
                stream.write_all(&bytes).await?;
            }
        }
    }
}
