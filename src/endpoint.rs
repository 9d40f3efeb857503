use crate::status::{Status, StatusSink};
use crate::transport::{shorten_url, CodecHeader, Dialer, MediaPacket, PublishSink};
use anyhow::{anyhow, bail, Result};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Two slots: one packet in flight on the wire, one staged behind it.
/// Anything beyond that is dropped at enqueue so a slow peer never backs
/// up into the publisher's read loop.
pub const QUEUE_CAPACITY: usize = 2;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long teardown waits for a worker to drain before aborting it. A
/// peer that blackholes writes must not hold the session teardown hostage.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// One output destination: a bounded packet queue drained by a worker task
/// that owns the outbound connection, dials on demand, and reconnects with
/// a fixed back-off. The connection handle never leaves the worker.
pub struct OutputEndpoint {
    url: String,
    header: Option<CodecHeader>,
    tx: Option<mpsc::Sender<MediaPacket>>,
    worker: Option<JoinHandle<()>>,
}

impl OutputEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            header: None,
            tx: None,
            worker: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Record the codec header to replay on every connect this session.
    /// Opens no connection.
    pub fn prime(&mut self, header: CodecHeader) {
        self.header = Some(header);
    }

    /// Open the packet queue and spawn the worker. One worker per session;
    /// a second call while one is running is ignored.
    pub fn start(&mut self, dialer: Arc<dyn Dialer>, sink: Arc<dyn StatusSink>) {
        if self.worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.tx = Some(tx);
        self.worker = Some(tokio::spawn(run_worker(
            self.url.clone(),
            self.header.clone(),
            rx,
            dialer,
            sink,
        )));
    }

    /// Non-blocking offer. With the queue full or the endpoint not started
    /// the packet is dropped; losing frames at a slow endpoint is the
    /// price of keeping every other endpoint live.
    pub fn enqueue(&self, packet: MediaPacket) {
        if let Some(tx) = &self.tx {
            if tx.try_send(packet).is_err() {
                debug!("queue full, dropping packet for {}", shorten_url(&self.url));
            }
        }
    }

    /// Close the queue, wait for the worker to drain and shut its
    /// connection, and reset to the pre-session state. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.header = None;
        self.tx = None;
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        match tokio::time::timeout(TEARDOWN_GRACE, &mut worker).await {
            Ok(res) => res.map_err(|e| anyhow!("worker for {} failed: {e}", shorten_url(&self.url))),
            Err(_) => {
                // dropping the task drops its connection with it
                worker.abort();
                let _ = worker.await;
                bail!("worker for {} did not drain in time", shorten_url(&self.url));
            }
        }
    }
}

/// Drain the queue until it closes. No connection: dial first, and on
/// failure back off one second and move on (the packet in hand is lost, a
/// deliberate trade; order is preserved). A failed write clears the
/// connection and holds in a redial loop until the peer is back.
async fn run_worker(
    url: String,
    header: Option<CodecHeader>,
    mut rx: mpsc::Receiver<MediaPacket>,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn StatusSink>,
) {
    let mut conn: Option<Box<dyn PublishSink>> = None;

    while let Some(packet) = rx.recv().await {
        if conn.is_none() {
            if rx.is_closed() {
                // tearing down, no point establishing a connection
                break;
            }
            match dial(&*dialer, &url, header.as_ref(), &*sink).await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    sink.log(
                        Status::Error,
                        &format!("Connection to {} failed: {e:#}", shorten_url(&url)),
                    );
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }

        let write_failed = match conn.as_mut() {
            Some(c) => c.write_packet(&packet).await.err(),
            None => None,
        };
        if let Some(e) = write_failed {
            conn = None;
            sink.log(
                Status::Error,
                &format!("Sending stream to {} failed: {e:#}", shorten_url(&url)),
            );

            while !rx.is_closed() {
                sleep(RECONNECT_DELAY).await;
                match dial(&*dialer, &url, header.as_ref(), &*sink).await {
                    Ok(c) => {
                        conn = Some(c);
                        break;
                    }
                    Err(e) => sink.log(
                        Status::Error,
                        &format!("Connection to {} failed: {e:#}", shorten_url(&url)),
                    ),
                }
            }
        }
    }

    if let Some(mut c) = conn.take() {
        match c.close().await {
            Ok(()) => sink.log(
                Status::Connect,
                &format!("Connection closed: {}", shorten_url(&url)),
            ),
            Err(e) => sink.log(
                Status::Error,
                &format!("Error disconnecting from {}: {e:#}", shorten_url(&url)),
            ),
        }
    }
}

/// Open a connection and replay the cached codec header before anything
/// else. A header that cannot be written counts as a failed dial.
async fn dial(
    dialer: &dyn Dialer,
    url: &str,
    header: Option<&CodecHeader>,
    sink: &dyn StatusSink,
) -> Result<Box<dyn PublishSink>> {
    let mut conn = dialer.dial(url).await?;
    if let Some(header) = header {
        if let Err(e) = conn.write_header(header).await {
            let _ = conn.close().await;
            return Err(e.context("failed writing header"));
        }
    }
    sink.log(
        Status::Connect,
        &format!("Connection established to: {}", shorten_url(url)),
    );
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TextSink;
    use crate::transport::mock::{DialOutcome, MockDialer, MockSink, SinkEvent};
    use crate::transport::{MediaKind, SequenceHeader};
    use bytes::Bytes;
    use std::sync::Mutex;

    fn test_header() -> CodecHeader {
        CodecHeader {
            metadata: None,
            streams: vec![
                SequenceHeader {
                    kind: MediaKind::Video,
                    payload: Bytes::from_static(&[0x17, 0x00, 0x01]),
                },
                SequenceHeader {
                    kind: MediaKind::Audio,
                    payload: Bytes::from_static(&[0xaf, 0x00, 0x12]),
                },
            ],
        }
    }

    fn packet(ts: u32) -> MediaPacket {
        MediaPacket {
            kind: MediaKind::Video,
            payload: Bytes::from_static(&[0x27, 0x01, 0x00]),
            timestamp_ms: ts,
        }
    }

    fn sink() -> Arc<dyn StatusSink> {
        Arc::new(TextSink)
    }

    async fn feed(ep: &OutputEndpoint, timestamps: impl IntoIterator<Item = u32>) {
        for ts in timestamps {
            ep.enqueue(packet(ts));
            // encoder pacing: give the worker a chance to drain
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_written_before_media() -> Result<()> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dialer = MockDialer::new(vec![DialOutcome::Connect(MockSink::recording(
            events.clone(),
        ))]);

        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.prime(test_header());
        ep.start(dialer.clone(), sink());
        feed(&ep, 1..=5).await;
        ep.disconnect().await?;

        let events = events.lock().unwrap();
        assert_eq!(events[0], SinkEvent::Header(2));
        let expected: Vec<_> = (1..=5).map(SinkEvent::Packet).collect();
        assert_eq!(&events[1..events.len() - 1], &expected[..]);
        assert_eq!(*events.last().unwrap(), SinkEvent::Closed);
        assert_eq!(dialer.dial_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_header_and_preserves_order() -> Result<()> {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let dialer = MockDialer::new(vec![
            DialOutcome::Connect(MockSink::failing_after(first.clone(), 3)),
            DialOutcome::Fail,
            DialOutcome::Connect(MockSink::recording(second.clone())),
        ]);

        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.prime(test_header());
        ep.start(dialer.clone(), sink());
        // pace slowly enough that the two second reconnect window passes
        // while the stream is still live
        for ts in 1..=20 {
            ep.enqueue(packet(ts));
            sleep(Duration::from_millis(300)).await;
        }
        ep.disconnect().await?;

        let first = first.lock().unwrap();
        assert_eq!(first[0], SinkEvent::Header(2));
        assert_eq!(first[1..], [1, 2, 3].map(SinkEvent::Packet));

        // the replacement connection gets the header again, then a
        // subsequence of the remaining packets in order
        let second = second.lock().unwrap();
        assert_eq!(second[0], SinkEvent::Header(2));
        let delivered: Vec<u32> = second[1..second.len() - 1]
            .iter()
            .map(|e| match e {
                SinkEvent::Packet(ts) => *ts,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert!(!delivered.is_empty());
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        assert!(delivered.iter().all(|ts| *ts > 3));
        assert_eq!(*second.last().unwrap(), SinkEvent::Closed);
        assert_eq!(dialer.dial_count(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failures_back_off_and_recover() -> Result<()> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dialer = MockDialer::new(vec![
            DialOutcome::Fail,
            DialOutcome::Fail,
            DialOutcome::Connect(MockSink::recording(events.clone())),
        ]);

        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.prime(test_header());
        ep.start(dialer.clone(), sink());
        // each failed dial costs a one second back-off; keep feeding long
        // enough for the third attempt to land
        for ts in 1..=10 {
            ep.enqueue(packet(ts));
            sleep(Duration::from_millis(600)).await;
        }
        ep.disconnect().await?;

        assert_eq!(dialer.dial_count(), 3);
        let events = events.lock().unwrap();
        assert_eq!(events[0], SinkEvent::Header(2));
        assert!(matches!(events[1], SinkEvent::Packet(_)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_bounded_and_aborted() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let dialer = MockDialer::new(vec![DialOutcome::Connect(MockSink::stalled(
            events.clone(),
        ))]);

        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.prime(test_header());
        ep.start(dialer.clone(), sink());
        feed(&ep, 1..=50).await;

        // the worker is wedged in its first write; teardown must still
        // complete, by force
        let res = ep.disconnect().await;
        assert!(res.is_err());

        // nothing beyond the header ever reached the wire
        assert_eq!(*events.lock().unwrap(), vec![SinkEvent::Header(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_safe_without_start() -> Result<()> {
        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.disconnect().await?;

        let dialer = MockDialer::new(vec![]);
        ep.start(dialer, sink());
        ep.disconnect().await?;
        ep.disconnect().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_disconnect_is_a_noop() -> Result<()> {
        let dialer = MockDialer::new(vec![]);
        let mut ep = OutputEndpoint::new("rtmp://a/live/x");
        ep.start(dialer.clone(), sink());
        ep.disconnect().await?;

        ep.enqueue(packet(1));
        assert_eq!(dialer.dial_count(), 0);
        Ok(())
    }
}
