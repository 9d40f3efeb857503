use crate::transport::{CodecHeader, Dialer, MediaKind, MediaPacket, PublishSink};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials real RTMP ingests. The one production `Dialer`.
pub struct RtmpDialer;

#[async_trait]
impl Dialer for RtmpDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn PublishSink>> {
        let conn = RtmpPublishConnection::connect(url).await?;
        Ok(Box::new(conn))
    }
}

/// A live outbound publish connection: handshake done, connection and
/// publish requests accepted, ready for header + media writes.
pub struct RtmpPublishConnection {
    socket: TcpStream,
    session: ClientSession,
}

impl RtmpPublishConnection {
    pub async fn connect(url: &str) -> Result<Self> {
        let (app, key) = split_publish_url(url)?;
        let deadline = Instant::now() + CONNECT_TIMEOUT;

        let u = Url::parse(url)?;
        let addrs = u.socket_addrs(|| Some(1935))?;
        let addr = addrs.first().context("DNS resolution failed")?;
        let socket = match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(res) => res?,
            Err(_) => bail!("timed out connecting to {addr}"),
        };

        let mut conn = Self::handshake(socket, deadline).await?;

        let result = conn.session.request_connection(app)?;
        conn.write_result(result).await?;
        conn.await_event(deadline, |e| matches!(e, ClientSessionEvent::ConnectionRequestAccepted))
            .await
            .context("connection request not accepted")?;

        let result = conn
            .session
            .request_publishing(key, PublishRequestType::Live)?;
        conn.write_result(result).await?;
        conn.await_event(deadline, |e| matches!(e, ClientSessionEvent::PublishRequestAccepted))
            .await
            .context("publish request not accepted")?;

        Ok(conn)
    }

    async fn handshake(mut socket: TcpStream, deadline: Instant) -> Result<Self> {
        let mut hs = Handshake::new(PeerType::Client);

        let exchange = hs.generate_outbound_p0_and_p1()?;
        socket.write_all(&exchange).await?;

        let mut buf = [0; 4096];
        loop {
            let n = match timeout_at(deadline, socket.read(&mut buf)).await {
                Ok(res) => res?,
                Err(_) => bail!("timed out during handshake"),
            };
            if n == 0 {
                bail!("EOF reached during handshake");
            }

            match hs.process_bytes(&buf[..n])? {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    socket.write_all(&response_bytes).await?;
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    socket.write_all(&response_bytes).await?;

                    let cfg = ClientSessionConfig::new();
                    let (mut session, initial) = ClientSession::new(cfg)?;
                    let mut pending = initial;
                    pending.extend(session.handle_input(&remaining_bytes)?);

                    let mut conn = Self { socket, session };
                    for result in pending {
                        conn.write_result(result).await?;
                    }
                    return Ok(conn);
                }
            }
        }
    }

    /// Read and process inbound traffic until `wanted` fires. A rejection
    /// from the peer fails immediately with its description.
    async fn await_event(
        &mut self,
        deadline: Instant,
        wanted: fn(&ClientSessionEvent) -> bool,
    ) -> Result<()> {
        let mut buf = [0; 4096];
        loop {
            let n = match timeout_at(deadline, self.socket.read(&mut buf)).await {
                Ok(res) => res?,
                Err(_) => bail!("timed out waiting for server response"),
            };
            if n == 0 {
                bail!("EOF reached while waiting for server response");
            }

            let results = self.session.handle_input(&buf[..n])?;
            let mut done = false;
            for result in results {
                match result {
                    ClientSessionResult::RaisedEvent(event) => {
                        if wanted(&event) {
                            done = true;
                        } else if let ClientSessionEvent::ConnectionRequestRejected {
                            description,
                        } = event
                        {
                            bail!("rejected by server: {description}");
                        } else {
                            debug!("ignoring event: {event:?}");
                        }
                    }
                    other => self.write_result(other).await?,
                }
            }
            if done {
                return Ok(());
            }
        }
    }

    async fn write_result(&mut self, result: ClientSessionResult) -> Result<()> {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            self.socket.write_all(&packet.bytes).await?;
        }
        Ok(())
    }

    /// Consume whatever control traffic the peer has sent (window acks,
    /// pings) so its acknowledgement flow never stalls the connection.
    async fn drain_control(&mut self) -> Result<()> {
        let mut buf = [0; 4096];
        loop {
            match self.socket.try_read(&mut buf) {
                Ok(0) => bail!("connection closed by peer"),
                Ok(n) => {
                    let results = self.session.handle_input(&buf[..n])?;
                    for result in results {
                        self.write_result(result).await?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn publish_media(&mut self, kind: MediaKind, payload: bytes::Bytes, timestamp_ms: u32) -> Result<()> {
        let timestamp = RtmpTimestamp::new(timestamp_ms);
        let result = match kind {
            MediaKind::Audio => self
                .session
                .publish_audio_data(payload, timestamp, false)
                .map_err(|e| anyhow!("failed to publish audio data: {e}"))?,
            MediaKind::Video => self
                .session
                .publish_video_data(payload, timestamp, false)
                .map_err(|e| anyhow!("failed to publish video data: {e}"))?,
        };
        self.write_result(result).await
    }
}

#[async_trait]
impl PublishSink for RtmpPublishConnection {
    async fn write_header(&mut self, header: &CodecHeader) -> Result<()> {
        if let Some(metadata) = &header.metadata {
            let result = self.session.publish_metadata(metadata)?;
            self.write_result(result).await?;
        }
        for stream in &header.streams {
            self.publish_media(stream.kind, stream.payload.clone(), 0)
                .await?;
        }
        Ok(())
    }

    async fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        self.drain_control().await?;
        self.publish_media(packet.kind, packet.payload.clone(), packet.timestamp_ms)
            .await
    }

    async fn close(&mut self) -> Result<()> {
        self.socket.shutdown().await?;
        Ok(())
    }
}

/// Split `rtmp://host[:port]/app/stream` into the connection app and the
/// publish stream key. Extra path segments extend the app, matching how
/// ingests with nested application names are addressed.
pub fn split_publish_url(url: &str) -> Result<(String, String)> {
    let u = Url::parse(url)?;
    let mut segments = u.path_segments().context("missing path in publish URL")?;
    let key = segments
        .next_back()
        .filter(|s| !s.is_empty())
        .context("missing stream key in publish URL")?
        .to_string();
    let app = segments.collect::<Vec<_>>().join("/");
    if app.is_empty() {
        bail!("missing app name in publish URL");
    }
    Ok((app, key))
}
