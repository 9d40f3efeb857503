use crate::transport::{is_sequence_header, CodecHeader, MediaKind, MediaPacket, PacketSource, SequenceHeader};
use anyhow::{bail, Result};
use async_trait::async_trait;
use log::debug;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// The app/key pair a publisher asked to stream under, surfaced before the
/// request is accepted so the relay can apply its admission check first.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub app: String,
    pub key: String,
}

struct PendingPublish {
    request_id: u32,
    app: String,
    key: String,
}

/// An accepted inbound RTMP connection being driven through the publish
/// lifecycle: handshake, publish request, codec header, media packets.
pub struct RtmpPublisher {
    socket: TcpStream,
    session: ServerSession,
    queue: VecDeque<ServerSessionResult>,
    pending_media: VecDeque<MediaPacket>,
    pending_publish: Option<PendingPublish>,
    metadata: Option<StreamMetadata>,
    publishing: bool,
    eof: bool,
}

impl RtmpPublisher {
    /// Run the server half of the RTMP handshake and set up the session.
    pub async fn accept(mut socket: TcpStream) -> Result<Self> {
        let mut hs = Handshake::new(PeerType::Server);

        let exchange = hs.generate_outbound_p0_and_p1()?;
        socket.write_all(&exchange).await?;

        let mut buf = [0; 4096];
        loop {
            let n = socket.read(&mut buf).await?;
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

                    let cfg = ServerSessionConfig::new();
                    let (mut session, mut results) = ServerSession::new(cfg)?;
                    results.extend(session.handle_input(&remaining_bytes)?);

                    let mut publisher = Self {
                        socket,
                        session,
                        queue: VecDeque::from(results),
                        pending_media: VecDeque::new(),
                        pending_publish: None,
                        metadata: None,
                        publishing: false,
                        eof: false,
                    };
                    publisher.flush().await?;
                    return Ok(publisher);
                }
            }
        }
    }

    /// Drive the session until the peer requests to publish. The request is
    /// not accepted yet; call `accept_publish` or `reject_publish`.
    pub async fn wait_for_publish(&mut self, timeout: Duration) -> Result<PublishRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(p) = &self.pending_publish {
                return Ok(PublishRequest {
                    app: p.app.clone(),
                    key: p.key.clone(),
                });
            }
            if self.eof {
                bail!("connection closed before publish request");
            }
            match timeout_at(deadline, self.read_more()).await {
                Ok(res) => res?,
                Err(_) => bail!("timed out waiting for publish request"),
            }
        }
    }

    pub async fn accept_publish(&mut self) -> Result<()> {
        let Some(pending) = self.pending_publish.take() else {
            bail!("no publish request pending");
        };
        let results = self.session.accept_request(pending.request_id)?;
        self.queue.extend(results);
        self.publishing = true;
        self.flush().await
    }

    /// Turn the publish request down and drop the connection without ever
    /// reading media from the peer.
    pub async fn reject_publish(&mut self, reason: &str) -> Result<()> {
        if let Some(pending) = self.pending_publish.take() {
            let results = self
                .session
                .reject_request(pending.request_id, "0", reason)?;
            self.queue.extend(results);
            self.flush().await?;
        }
        self.socket.shutdown().await.ok();
        self.eof = true;
        Ok(())
    }

    /// Collect the codec header: stream metadata plus every sequence header
    /// that precedes the first real media packet. That packet stays queued
    /// for the subsequent `read_packet` calls.
    pub async fn read_header(&mut self, timeout: Duration) -> Result<CodecHeader> {
        let deadline = Instant::now() + timeout;
        let mut streams = Vec::new();
        loop {
            match self.pending_media.front() {
                Some(p) if is_sequence_header(p.kind, &p.payload) => {
                    if let Some(p) = self.pending_media.pop_front() {
                        streams.push(SequenceHeader {
                            kind: p.kind,
                            payload: p.payload,
                        });
                    }
                }
                Some(_) => {
                    return Ok(CodecHeader {
                        metadata: self.metadata.clone(),
                        streams,
                    });
                }
                None => {
                    if self.eof {
                        bail!("connection closed before any media arrived");
                    }
                    match timeout_at(deadline, self.read_more()).await {
                        Ok(res) => res?,
                        Err(_) => bail!("timed out waiting for codec headers"),
                    }
                }
            }
        }
    }

    async fn read_more(&mut self) -> Result<()> {
        let mut buf = [0; 4096];
        let n = self.socket.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
            return Ok(());
        }
        let results = self.session.handle_input(&buf[..n])?;
        self.queue.extend(results);
        self.flush().await
    }

    /// Write out pending responses and apply raised events. Events may push
    /// further results onto the queue.
    async fn flush(&mut self) -> Result<()> {
        while let Some(result) = self.queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    self.socket.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => self.handle_event(event)?,
                ServerSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ServerSessionEvent) -> Result<()> {
        match event {
            ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                let results = self.session.accept_request(request_id)?;
                self.queue.extend(results);
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                mode,
            } => {
                if self.publishing || self.pending_publish.is_some() {
                    let results =
                        self.session
                            .reject_request(request_id, "0", "stream already published")?;
                    self.queue.extend(results);
                } else {
                    debug!("publish requested: {app_name}/{stream_key} [{mode:?}]");
                    self.pending_publish = Some(PendingPublish {
                        request_id,
                        app: app_name,
                        key: stream_key,
                    });
                }
            }
            ServerSessionEvent::PlayStreamRequested { request_id, .. } => {
                let results = self
                    .session
                    .reject_request(request_id, "0", "playback not supported")?;
                self.queue.extend(results);
            }
            ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
                self.metadata = Some(metadata);
            }
            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                if self.publishing {
                    self.pending_media.push_back(MediaPacket {
                        kind: MediaKind::Audio,
                        payload: data,
                        timestamp_ms: timestamp.value,
                    });
                }
            }
            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                if self.publishing {
                    self.pending_media.push_back(MediaPacket {
                        kind: MediaKind::Video,
                        payload: data,
                        timestamp_ms: timestamp.value,
                    });
                }
            }
            ServerSessionEvent::ClientChunkSizeChanged { new_chunk_size } => {
                debug!("client chunk size: {new_chunk_size}");
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PacketSource for RtmpPublisher {
    async fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        loop {
            if let Some(packet) = self.pending_media.pop_front() {
                return Ok(Some(packet));
            }
            if self.eof {
                return Ok(None);
            }
            self.read_more().await?;
        }
    }
}
