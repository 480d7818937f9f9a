//! The uniform capability set every venue adapter implements.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{CanonicalRecord, Interval, StreamDescriptor};

/// One or more frames to send, spaced by at least 140ms by the transport
/// driver to respect venue rate limits.
#[derive(Debug, Clone)]
pub enum FrameList {
    One(String),
    Many(Vec<String>),
}

impl FrameList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            FrameList::One(s) => vec![s],
            FrameList::Many(v) => v,
        }
    }
}

/// The result of [`Adapter::subscription_frames`]: everything the transport
/// driver needs to open and maintain one connection.
#[derive(Debug, Clone)]
pub struct SubscriptionPlan {
    pub url_suffix: String,
    pub on_open: Option<FrameList>,
    pub on_close: Option<FrameList>,
    pub ping_interval: Option<std::time::Duration>,
    pub ping_timeout: Option<std::time::Duration>,
}

/// A raw frame delivered off the wire, already gzip-inflated if the venue
/// requires it.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// What the transport driver should do after handing one frame to
/// [`Adapter::decode`].
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// A canonical record for the given stream key, to be written to the
    /// snapshot store.
    Record(String, CanonicalRecord),
    /// An application-level keepalive that must be answered in-line with
    /// the given text frame (e.g. Bingx's gzip ping, OKX's text "ping").
    Reply(String),
    /// Unrecognized frame, or a keepalive the adapter already fully
    /// handled itself; nothing for the transport to do.
    Ignored,
}

/// The venue-specific plugin. One instance is owned by exactly one
/// [`crate::Facade`].
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Resolves the REST API base URL for the current `testmode` setting.
    fn api_url(&self) -> String;

    /// Resolves the WebSocket URL to connect to. Most venues return a fixed
    /// host; Kucoin mints a one-time token endpoint in `start()` and
    /// returns it here instead.
    fn websocket_url(&self) -> String;

    /// Fetches (and 7200s-TTL caches) the symbol catalog in canonical
    /// `"BASE/QUOTE"` form.
    async fn full_symbol_list(&self, sorted: bool) -> Result<Vec<String>>;

    /// Catalog membership test for a canonical symbol.
    async fn is_symbol_supported(&self, canonical_symbol: &str) -> bool;

    fn canonicalize_symbol(&self, venue_symbol: &str) -> Option<String>;
    fn decanonicalize_symbol(&self, canonical_symbol: &str) -> String;

    fn canonicalize_interval(&self, venue_interval: &str) -> Option<Interval>;
    fn decanonicalize_interval(&self, interval: Interval) -> Option<String>;

    /// Canonical key function; delegates to
    /// `record::stream_key` so every adapter shares one implementation.
    fn stream_key(&self, descriptor: &StreamDescriptor) -> String {
        descriptor.stream_key()
    }

    /// Builds the subscribe/unsubscribe frames and keepalive cadence for one
    /// registered stream.
    fn subscription_plan(&self, descriptor: &StreamDescriptor) -> SubscriptionPlan;

    /// Decodes one raw frame, dispatching it to the right endpoint handler
    /// by the venue's own classification rule. Never returns an `Err` —
    /// decode failures are logged and swallowed; the consumer never sees
    /// per-frame decode errors.
    async fn decode(&self, frame: RawFrame) -> DecodeOutcome;

    /// Called once per reconnect so stale order-book deltas and buffered
    /// state are discarded.
    fn reset_transient_state(&self);

    /// Application-level ping frame to send on `ping_interval`, for venues
    /// without transport-level WebSocket ping/pong (Bybit, Kucoin, OKX).
    /// `None` means the transport relies on the WebSocket protocol's own
    /// ping/pong (Binance, Binance-US).
    fn app_ping_frame(&self) -> Option<String> {
        None
    }

    /// Recognizes an application-level pong reply to `app_ping_frame`, so
    /// the transport driver can reset its pong deadline. Default `false`;
    /// venues that answer pings at the WebSocket protocol level (Binance,
    /// Binance-US) never need this, since `WsMessage::Pong` already resets
    /// the deadline directly.
    fn is_pong(&self, _text: &str) -> bool {
        false
    }

    /// Whether this venue's binary frames are gzip-compressed and must be
    /// inflated before decode (Bingx).
    fn uses_gzip(&self) -> bool {
        false
    }

    /// Starts auxiliary background workers (REST pollers, ping threads).
    /// Default no-op for venues that need none.
    async fn start(&self) {}

    /// A receiver fed by a background poller (Bingx's REST-polled trades
    /// and ticker, which have no WebSocket push equivalent). The transport
    /// driver selects on this alongside the socket read loop and dispatches
    /// whatever arrives through the same `decode()`. `None` for every venue
    /// whose data all arrives over the WebSocket.
    fn relay_subscribe(&self) -> Option<tokio::sync::broadcast::Receiver<RawFrame>> {
        None
    }

    /// Stops auxiliary background workers. Default no-op.
    async fn stop(&self) {}

    fn exchange_name(&self) -> &'static str;
}
