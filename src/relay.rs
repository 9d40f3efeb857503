use crate::endpoint::OutputEndpoint;
use crate::settings::{normalize_bind_addr, Settings};
use crate::status::{Status, StatusSink};
use crate::transport::client::RtmpDialer;
use crate::transport::server::{PublishRequest, RtmpPublisher};
use crate::transport::{shorten_url, CodecHeader, Dialer, PacketSource};
use anyhow::{Context, Result};
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use uuid::Uuid;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide supervisor: owns the output endpoint set, listens for
/// inbound publishes and runs one fan-out session per accepted publisher.
/// Sessions are handled sequentially, so at most one publish is live and a
/// second publisher simply waits in the accept backlog.
pub struct Relay {
    settings: Settings,
    endpoints: Vec<OutputEndpoint>,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn StatusSink>,
}

impl Relay {
    pub fn new(settings: Settings, sink: Arc<dyn StatusSink>) -> Self {
        Self::with_dialer(settings, sink, Arc::new(RtmpDialer))
    }

    pub fn with_dialer(
        settings: Settings,
        sink: Arc<dyn StatusSink>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let endpoints = settings
            .endpoints
            .iter()
            .filter(|e| e.enabled)
            .map(|e| OutputEndpoint::new(e.url.clone()))
            .collect();
        Self {
            settings,
            endpoints,
            dialer,
            sink,
        }
    }

    /// Bind the listen address and serve publish sessions until the
    /// listener dies. A failed bind is the only fatal error.
    pub async fn run(&mut self) -> Result<()> {
        let addr = normalize_bind_addr(&self.settings.bind);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind RTMP listener on {addr}"))?;

        info!("RTMP listening on: {addr}");
        self.sink
            .log(Status::Info, "Waiting for incoming connection...");

        while let Ok((socket, peer)) = listener.accept().await {
            if let Err(e) = self.handle_publish(socket, peer).await {
                self.sink
                    .log(Status::Error, &format!("Publish session failed: {e:#}"));
            }
            self.sink
                .log(Status::Info, "Waiting for incoming connection...");
        }
        info!("Server closed");
        Ok(())
    }

    async fn handle_publish(&mut self, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        let session_id = Uuid::new_v4();
        debug!("session {session_id}: TCP connection from {peer}");

        let mut publisher = RtmpPublisher::accept(socket).await?;
        let request = publisher.wait_for_publish(PUBLISH_TIMEOUT).await?;

        if let Some(secret) = self.settings.key.clone() {
            if !key_matches(&request, &secret) {
                publisher.reject_publish("invalid stream key").await.ok();
                self.sink.log(
                    Status::Error,
                    &format!("Rejected publish from {peer}: stream key mismatch"),
                );
                return Ok(());
            }
        }
        publisher.accept_publish().await?;
        self.sink.log(
            Status::Connect,
            &format!("Incoming RTMP connection from: {peer}"),
        );

        let header = match publisher.read_header(HEADER_TIMEOUT).await {
            Ok(header) => header,
            Err(e) => {
                self.sink
                    .log(Status::Error, &format!("Can't retrieve stream headers: {e:#}"));
                return Ok(());
            }
        };

        debug!(
            "session {session_id}: publishing {}/{} with {} header streams",
            request.app,
            request.key,
            header.streams.len()
        );
        self.run_session(&mut publisher, header).await;
        Ok(())
    }

    /// One publish session: prime and start every endpoint, pump packets
    /// from the publisher into all of them, and tear everything down when
    /// the publisher goes away.
    async fn run_session<S: PacketSource>(&mut self, source: &mut S, header: CodecHeader) {
        for ep in &mut self.endpoints {
            ep.prime(header.clone());
            ep.start(self.dialer.clone(), self.sink.clone());
        }

        let mut last_progress = Instant::now();
        loop {
            match source.read_packet().await {
                Ok(Some(packet)) => {
                    if last_progress.elapsed() >= Duration::from_secs(1) {
                        self.sink.replace(
                            Status::Progress,
                            &format!("Stream duration: {}", fmt_timestamp(packet.timestamp_ms)),
                        );
                        last_progress = Instant::now();
                    }
                    for ep in &self.endpoints {
                        ep.enqueue(packet.clone());
                    }
                }
                Ok(None) => {
                    self.sink.log(Status::Info, "Incoming connection closed");
                    break;
                }
                Err(e) => {
                    self.sink
                        .log(Status::Error, &format!("Incoming connection aborted: {e:#}"));
                    break;
                }
            }
        }

        for ep in &mut self.endpoints {
            if let Err(e) = ep.disconnect().await {
                self.sink.log(
                    Status::Error,
                    &format!("Error disconnecting from {}: {e:#}", shorten_url(ep.url())),
                );
            }
        }
    }
}

/// The publish path is `app/key`; admission requires the configured secret
/// to be its suffix, so keys may carry a platform prefix.
fn key_matches(request: &PublishRequest, secret: &str) -> bool {
    format!("{}/{}", request.app, request.key).ends_with(secret)
}

fn fmt_timestamp(ms: u32) -> String {
    let total = ms / 1000;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
