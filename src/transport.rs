//! WebSocket client with reconnect and ping scheduling.
//!
//! One `Transport` drives exactly one upstream connection on behalf of one
//! adapter, writing decoded records into the shared [`SnapshotStore`] and
//! observing a shutdown flag at every suspension point.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, DecodeOutcome, RawFrame};
use crate::store::SnapshotStore;

/// Minimum spacing between frames sent on connection open/close, to respect
/// venue rate limits.
const FRAME_SPACING: Duration = Duration::from_millis(140);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub struct Transport {
    adapter: Arc<dyn Adapter>,
    store: Arc<SnapshotStore>,
    url: String,
    on_open: Vec<String>,
    on_close: Vec<String>,
    ping_interval: Option<Duration>,
    ping_timeout: Option<Duration>,
    stop_flag: Arc<AtomicBool>,
    debug: bool,
}

impl Transport {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        store: Arc<SnapshotStore>,
        url: String,
        on_open: Vec<String>,
        on_close: Vec<String>,
        ping_interval: Option<Duration>,
        ping_timeout: Option<Duration>,
        stop_flag: Arc<AtomicBool>,
        debug: bool,
    ) -> Self {
        Self {
            adapter,
            store,
            url,
            on_open,
            on_close,
            ping_interval,
            ping_timeout,
            stop_flag,
            debug,
        }
    }

    /// Runs the connect/read/reconnect loop until `stop_flag` is set.
    /// Returns once the loop has observed the flag and sent the unsubscribe
    /// frames on a best-effort basis.
    pub async fn run(self) {
        let mut backoff = RECONNECT_BASE_DELAY;

        while !self.stop_flag.load(Ordering::SeqCst) {
            match self.connect_and_serve().await {
                Ok(()) => {
                    backoff = RECONNECT_BASE_DELAY;
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "connection ended, reconnecting");
                    self.adapter.reset_transient_state();
                }
            }

            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
        }

        info!(url = %self.url, "transport stopped");
    }

    async fn connect_and_serve(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url).await?;
        info!(url = %self.url, "connected");
        let (mut write, mut read) = ws_stream.split();

        for frame in &self.on_open {
            debug!(%frame, "sending on_open frame");
            write.send(WsMessage::Text(frame.clone())).await?;
            tokio::time::sleep(FRAME_SPACING).await;
        }

        let mut ping_deadline = self
            .ping_interval
            .map(|interval| tokio::time::Instant::now() + interval);

        let mut last_pong = tokio::time::Instant::now();

        let mut relay_rx = self.adapter.relay_subscribe();

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                for frame in &self.on_close {
                    let _ = write.send(WsMessage::Text(frame.clone())).await;
                    tokio::time::sleep(FRAME_SPACING).await;
                }
                let _ = write.close().await;
                break;
            }

            if let Some(timeout) = self.ping_timeout {
                if last_pong.elapsed() > timeout {
                    warn!(url = %self.url, ?timeout, "no pong within timeout, forcing reconnect");
                    return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
                }
            }

            let next_ping = ping_deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep_until(next_ping), if ping_deadline.is_some() => {
                    if let Some(app_ping) = self.adapter.app_ping_frame() {
                        debug!("sending application-level ping");
                        write.send(WsMessage::Text(app_ping)).await?;
                    } else {
                        write.send(WsMessage::Ping(Vec::new())).await?;
                    }
                    ping_deadline = self.ping_interval.map(|interval| tokio::time::Instant::now() + interval);
                }
                relay_msg = recv_relay(&mut relay_rx), if relay_rx.is_some() => {
                    if let Some(frame) = relay_msg {
                        self.dispatch(frame, &mut write).await?;
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
                    };
                    let msg = msg?;

                    match msg {
                        WsMessage::Text(text) => {
                            if self.debug {
                                debug!(%text, "received frame");
                            }
                            if self.adapter.is_pong(&text) {
                                last_pong = tokio::time::Instant::now();
                            }
                            self.dispatch(RawFrame::Text(text), &mut write).await?;
                        }
                        WsMessage::Binary(bytes) => {
                            let bytes = if self.adapter.uses_gzip() {
                                match inflate(&bytes) {
                                    Some(inflated) => inflated,
                                    None => {
                                        warn!("failed to inflate gzip frame");
                                        continue;
                                    }
                                }
                            } else {
                                bytes
                            };
                            self.dispatch(RawFrame::Binary(bytes), &mut write).await?;
                        }
                        WsMessage::Ping(payload) => {
                            write.send(WsMessage::Pong(payload)).await?;
                        }
                        WsMessage::Pong(_) => {
                            last_pong = tokio::time::Instant::now();
                        }
                        WsMessage::Close(frame) => {
                            info!(?frame, "connection closed by peer");
                            return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
                        }
                        WsMessage::Frame(_) => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        frame: RawFrame,
        write: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        match self.adapter.decode(frame).await {
            DecodeOutcome::Record(stream_key, record) => {
                self.store.set(stream_key, record);
            }
            DecodeOutcome::Reply(reply) => {
                write.send(WsMessage::Text(reply)).await?;
            }
            DecodeOutcome::Ignored => {}
        }
        Ok(())
    }
}

async fn recv_relay(rx: &mut Option<tokio::sync::broadcast::Receiver<RawFrame>>) -> Option<RawFrame> {
    match rx {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

/// Inflates a gzip-compressed binary frame.
pub fn inflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Some(out),
        Err(err) => {
            error!(error = %err, "gzip inflate failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn inflate_round_trips_gzip_compressed_json() {
        let payload = br#"{"ping":1,"time":2}"#;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = inflate(&compressed).unwrap();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn inflate_returns_none_for_garbage() {
        assert!(inflate(b"not gzip data").is_none());
    }
}
