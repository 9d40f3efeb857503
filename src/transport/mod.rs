use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rml_rtmp::sessions::StreamMetadata;
use url::Url;

pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One media frame as carried over RTMP: an opaque FLV tag body plus its
/// presentation timestamp. The relay never looks inside the payload.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub payload: Bytes,
    pub timestamp_ms: u32,
}

/// Per-substream codec configuration (AVC decoder config, AAC audio
/// specific config), replayed verbatim on every outbound (re)connect.
#[derive(Debug, Clone)]
pub struct SequenceHeader {
    pub kind: MediaKind,
    pub payload: Bytes,
}

/// Everything a downstream ingest must receive before the first media
/// packet: the publisher's stream metadata and the sequence headers in the
/// order they were observed.
#[derive(Debug, Clone, Default)]
pub struct CodecHeader {
    pub metadata: Option<StreamMetadata>,
    pub streams: Vec<SequenceHeader>,
}

/// Inbound side of a publish session: yields media packets in publisher
/// order. `Ok(None)` is a clean end of stream; `Err` is an abnormal one.
#[async_trait]
pub trait PacketSource: Send {
    async fn read_packet(&mut self) -> Result<Option<MediaPacket>>;
}

/// Outbound side: a live connection to one downstream ingest.
#[async_trait]
pub trait PublishSink: Send {
    async fn write_header(&mut self, header: &CodecHeader) -> Result<()>;

    async fn write_packet(&mut self, packet: &MediaPacket) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens outbound publish connections. A seam so the relay core can be
/// exercised against in-memory peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn PublishSink>>;
}

/// FLV tag bodies mark codec configuration in their second byte: AVC/HEVC
/// video with AVCPacketType 0, AAC audio with AACPacketType 0.
pub fn is_sequence_header(kind: MediaKind, payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    match kind {
        MediaKind::Video => matches!(payload[0] & 0x0f, 7 | 12) && payload[1] == 0,
        MediaKind::Audio => payload[0] >> 4 == 10 && payload[1] == 0,
    }
}

/// Reduce an endpoint URL to its host for log lines; stream keys stay out
/// of the log.
pub fn shorten_url(url: &str) -> String {
    let Ok(u) = Url::parse(url) else {
        return url.to_string();
    };
    match (u.host_str(), u.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => url.to_string(),
    }
}
