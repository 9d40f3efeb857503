//! In-memory transport peers for exercising the relay without sockets.

use crate::transport::{CodecHeader, Dialer, MediaPacket, PacketSource, PublishSink};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SinkEvent {
    Header(usize),
    Packet(u32),
    Closed,
}

/// What a `MockDialer` hands out for one dial attempt.
pub(crate) enum DialOutcome {
    Fail,
    Connect(MockSink),
}

pub(crate) struct MockDialer {
    outcomes: Mutex<VecDeque<DialOutcome>>,
    by_url: Mutex<HashMap<String, VecDeque<DialOutcome>>>,
    pub dials: AtomicUsize,
}

impl MockDialer {
    pub fn new(outcomes: Vec<DialOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::from(outcomes)),
            by_url: Mutex::new(HashMap::new()),
            dials: AtomicUsize::new(0),
        })
    }

    /// Script outcomes per destination URL, for tests where several
    /// endpoints dial concurrently in no fixed order.
    pub fn keyed(outcomes: Vec<(&str, Vec<DialOutcome>)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            by_url: Mutex::new(
                outcomes
                    .into_iter()
                    .map(|(url, o)| (url.to_string(), VecDeque::from(o)))
                    .collect(),
            ),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn PublishSink>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let keyed = self
            .by_url
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        let outcome = match keyed {
            Some(o) => Some(o),
            None => self.outcomes.lock().unwrap().pop_front(),
        };
        match outcome {
            Some(DialOutcome::Connect(sink)) => Ok(Box::new(sink)),
            Some(DialOutcome::Fail) | None => bail!("mock dial refused"),
        }
    }
}

/// Records everything written to it. Can be scripted to stall forever or
/// to fail packet writes after a given count.
pub(crate) struct MockSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
    fail_writes_after: Option<usize>,
    stall_writes: bool,
    written: usize,
}

impl MockSink {
    pub fn recording(events: Arc<Mutex<Vec<SinkEvent>>>) -> Self {
        Self {
            events,
            fail_writes_after: None,
            stall_writes: false,
            written: 0,
        }
    }

    pub fn failing_after(events: Arc<Mutex<Vec<SinkEvent>>>, packets: usize) -> Self {
        Self {
            fail_writes_after: Some(packets),
            ..Self::recording(events)
        }
    }

    pub fn stalled(events: Arc<Mutex<Vec<SinkEvent>>>) -> Self {
        Self {
            stall_writes: true,
            ..Self::recording(events)
        }
    }
}

#[async_trait]
impl PublishSink for MockSink {
    async fn write_header(&mut self, header: &CodecHeader) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Header(header.streams.len()));
        Ok(())
    }

    async fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        if self.stall_writes {
            std::future::pending::<()>().await;
        }
        if let Some(limit) = self.fail_writes_after {
            if self.written >= limit {
                bail!("mock write failure");
            }
        }
        self.written += 1;
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Packet(packet.timestamp_ms));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.events.lock().unwrap().push(SinkEvent::Closed);
        Ok(())
    }
}

/// Scripted publisher. Yields one packet per `read_packet` call with a
/// small pause so endpoint workers get scheduled between packets, the way
/// a real encoder paces its output.
pub(crate) struct MockSource {
    packets: VecDeque<MediaPacket>,
    period: Duration,
    fail_at_end: bool,
}

impl MockSource {
    pub fn new(packets: Vec<MediaPacket>) -> Self {
        Self::paced(packets, Duration::from_millis(1))
    }

    pub fn paced(packets: Vec<MediaPacket>, period: Duration) -> Self {
        Self {
            packets: VecDeque::from(packets),
            period,
            fail_at_end: false,
        }
    }

    pub fn aborting(packets: Vec<MediaPacket>) -> Self {
        Self {
            fail_at_end: true,
            ..Self::new(packets)
        }
    }
}

#[async_trait]
impl PacketSource for MockSource {
    async fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        match self.packets.pop_front() {
            Some(packet) => {
                tokio::time::sleep(self.period).await;
                Ok(Some(packet))
            }
            None if self.fail_at_end => bail!("mock publisher aborted"),
            None => Ok(None),
        }
    }
}
