/*
 * This file is a part of Nomos
*/

//! Connects outbound to a configured master, streams replication frames from
//! it and applies them locally, persisting a cursor so a restart resumes
//! roughly where it left off (spec §4.5, client side).

use crate::engine::replication::frame::{decode_frame, Frame};
use crate::engine::replication::log::Cursor;
use crate::engine::replication::wire::{ReadBinLogAnswer, ReadBinLogRequest, SenderHandshakeRequest};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Implemented by `IndexDirectory` so the client doesn't need to know about
/// the whole engine, just how to hand a decoded frame back into it.
pub trait FrameSink: Send + Sync {
    fn apply_remote_frame(&self, frame: Frame, peer_id: u32, now: u32);
}

const RECEIVE_DEADLINE: Duration = Duration::from_secs(60);
const MIN_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(64);
const IDLE_POLL_DELAY: Duration = Duration::from_millis(200);

pub struct ReplicationPeerClient<S> {
    master: SocketAddr,
    own_server_id: u32,
    replication_log_path: PathBuf,
    sink: Arc<S>,
}

impl<S: FrameSink + 'static> ReplicationPeerClient<S> {
    pub fn new(
        master: SocketAddr,
        own_server_id: u32,
        replication_log_path: impl Into<PathBuf>,
        sink: Arc<S>,
    ) -> Self {
        Self {
            master,
            own_server_id,
            replication_log_path: replication_log_path.into(),
            sink,
        }
    }

    fn cursor_path(&self, peer_id: u32) -> PathBuf {
        self.replication_log_path
            .join(format!("nomos_repl_info_{peer_id}"))
    }

    fn load_cursor(&self, peer_id: u32) -> Cursor {
        match std::fs::read_to_string(self.cursor_path(peer_id)) {
            Ok(s) => parse_cursor(&s).unwrap_or(Cursor { segment: 1, offset: 0 }),
            Err(_) => Cursor { segment: 1, offset: 0 },
        }
    }

    fn save_cursor(&self, peer_id: u32, cursor: Cursor) {
        let path = self.cursor_path(peer_id);
        let contents = format!("{}-{}\n", cursor.segment, cursor.offset);
        if let Ok(mut f) = std::fs::File::create(&path) {
            let _ = f.write_all(contents.as_bytes());
        }
    }

    /// Run forever: connect, stream, reconnect with backoff on any error,
    /// until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = MIN_RECONNECT_BACKOFF;
        loop {
            tokio::select! {
                result = self.connect_and_stream() => {
                    if let Err(e) = result {
                        log::warn!("replication link to {} lost: {e}", self.master);
                    }
                }
                _ = shutdown.recv() => {
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.recv() => return,
            }
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
        }
    }

    async fn connect_and_stream(&self) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(self.master).await?;

        let handshake = SenderHandshakeRequest::new(self.own_server_id);
        let mut buf = Vec::new();
        handshake
            .encode_to(&mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        stream.write_all(&buf).await?;

        let mut id_buf = [0u8; 4];
        stream.read_exact(&mut id_buf).await?;
        let peer_id = u32::from_le_bytes(id_buf);

        let mut cursor = self.load_cursor(peer_id);

        loop {
            let req = ReadBinLogRequest {
                segment_number: cursor.segment,
                offset: cursor.offset as u32,
            };
            let mut req_buf = Vec::new();
            req.encode_to(&mut req_buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            stream.write_all(&req_buf).await?;

            let mut answer_buf = [0u8; 12];
            timeout(RECEIVE_DEADLINE, stream.read_exact(&mut answer_buf)).await??;
            let answer = ReadBinLogAnswer::decode_from(&mut &answer_buf[..])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

            if answer.size > 0 {
                let mut payload = vec![0u8; answer.size as usize];
                timeout(RECEIVE_DEADLINE, stream.read_exact(&mut payload)).await??;

                let now = crate::registry::wall_clock_seconds();
                let mut cur = &payload[..];
                while let Some(frame) = decode_frame(&mut cur)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
                {
                    self.sink.apply_remote_frame(frame, peer_id, now);
                }

                cursor = Cursor {
                    segment: answer.segment_number,
                    offset: answer.offset as u64,
                };
                self.save_cursor(peer_id, cursor);
            } else {
                cursor = Cursor {
                    segment: answer.segment_number,
                    offset: answer.offset as u64,
                };
                tokio::time::sleep(IDLE_POLL_DELAY).await;
            }
        }
    }
}

fn parse_cursor(s: &str) -> Option<Cursor> {
    let (seg, off) = s.trim().split_once('-')?;
    Some(Cursor {
        segment: seg.parse().ok()?,
        offset: off.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_parses_expected_format() {
        assert_eq!(
            parse_cursor("3-128\n"),
            Some(Cursor { segment: 3, offset: 128 })
        );
        assert_eq!(parse_cursor("garbage"), None);
    }
}
