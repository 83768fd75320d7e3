//! Snapshot distribution between monitor processes.
//!
//! The publisher side serializes each snapshot and offers it to a
//! datagram publication; sends are best-effort with a small bounded
//! retry against backpressure, favouring recency over completeness. The
//! subscriber side polls a bounded number of datagrams per invocation
//! and feeds every decoded snapshot to its consumer. The publication /
//! subscription seams are traits so tests can script transport
//! behaviour.

use std::net::UdpSocket;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::aggregator::SnapshotConsumer;
use crate::model::Snapshot;
use crate::wire::{decode_snapshot, encode_snapshot};

/// Attempts per snapshot before it is dropped under backpressure.
pub const SEND_RETRY_LIMIT: u32 = 5;

/// Datagrams handled per subscriber poll.
pub const POLL_LIMIT: usize = 10;

/// Largest frame a datagram publication will carry (UDP payload ceiling).
const MAX_FRAME_LENGTH: usize = 65_507;

/// Default destination for snapshot distribution.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:15566";

/// Default stream id for snapshot distribution.
pub const DEFAULT_STREAM_ID: i32 = 0xAE01;

/// Addressing for the snapshot publish/subscribe endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Destination (publish) or bind (subscribe) socket address.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Stream id carried in every frame; mismatches are discarded.
    #[serde(default = "default_stream_id")]
    pub stream_id: i32,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_owned()
}

fn default_stream_id() -> i32 {
    DEFAULT_STREAM_ID
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            stream_id: default_stream_id(),
        }
    }
}

/// Outcome of offering one frame to a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Transient flow-control pushback; the caller may retry.
    Backpressured,
    /// The publication can no longer carry frames. Fatal.
    Closed,
}

/// Non-blocking sender of encoded snapshot frames.
pub trait Publication: Send {
    fn offer(&mut self, payload: &[u8]) -> Offer;
}

/// Non-blocking receiver of encoded snapshot frames.
pub trait Subscription: Send {
    /// Poll up to `limit` frames, invoking `handler` for each payload.
    /// The payload slice is only valid for the duration of the call.
    fn poll(
        &mut self,
        handler: &mut dyn FnMut(&[u8]) -> Result<()>,
        limit: usize,
    ) -> Result<usize>;
}

/// Datagram publication: one frame per send, stream id prefixed.
pub struct UdpPublication {
    socket: UdpSocket,
    stream_id: i32,
    frame: Vec<u8>,
}

impl UdpPublication {
    /// Bind an ephemeral local port and aim at the configured endpoint.
    pub fn connect(config: &ChannelConfig) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("binding publication socket")?;
        socket
            .connect(&config.endpoint)
            .with_context(|| format!("connecting publication to {}", config.endpoint))?;
        socket
            .set_nonblocking(true)
            .context("setting publication non-blocking")?;

        Ok(Self {
            socket,
            stream_id: config.stream_id,
            frame: Vec::new(),
        })
    }
}

impl Publication for UdpPublication {
    fn offer(&mut self, payload: &[u8]) -> Offer {
        if payload.len() + 4 > MAX_FRAME_LENGTH {
            warn!(length = payload.len(), "snapshot exceeds datagram capacity");
            return Offer::Closed;
        }

        self.frame.clear();
        self.frame.extend_from_slice(&self.stream_id.to_le_bytes());
        self.frame.extend_from_slice(payload);

        match self.socket.send(&self.frame) {
            Ok(_) => Offer::Accepted,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Offer::Backpressured,
            Err(e) => {
                warn!(error = %e, "publication send failed");
                Offer::Closed
            }
        }
    }
}

/// Datagram subscription bound to the configured endpoint.
pub struct UdpSubscription {
    socket: UdpSocket,
    stream_id: i32,
    // One datagram per recv; sized to the UDP payload ceiling.
    buffer: Box<[u8; MAX_FRAME_LENGTH]>,
}

impl UdpSubscription {
    pub fn bind(config: &ChannelConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.endpoint)
            .with_context(|| format!("binding subscription to {}", config.endpoint))?;
        socket
            .set_nonblocking(true)
            .context("setting subscription non-blocking")?;

        Ok(Self {
            socket,
            stream_id: config.stream_id,
            buffer: Box::new([0u8; MAX_FRAME_LENGTH]),
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.socket.local_addr().context("subscription local addr")
    }
}

impl Subscription for UdpSubscription {
    fn poll(
        &mut self,
        handler: &mut dyn FnMut(&[u8]) -> Result<()>,
        limit: usize,
    ) -> Result<usize> {
        let mut handled = 0;
        while handled < limit {
            let length = match self.socket.recv(&mut self.buffer[..]) {
                Ok(length) => length,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("subscription recv"),
            };

            if length < 4 {
                trace!(length, "runt frame discarded");
                continue;
            }

            let stream_id =
                i32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
            if stream_id != self.stream_id {
                trace!(stream_id, "frame for foreign stream discarded");
                continue;
            }

            handler(&self.buffer[4..length])?;
            handled += 1;
        }
        Ok(handled)
    }
}

/// Snapshot consumer that forwards each snapshot over a publication.
///
/// Backpressure is retried up to [`SEND_RETRY_LIMIT`] times, then the
/// snapshot is dropped: the next scan will supply fresher data anyway. A
/// closed publication is fatal and propagates as an error.
pub struct SnapshotPublisher {
    publication: Box<dyn Publication>,
    // Encode scratch, reused across snapshots.
    buffer: Vec<u8>,
}

impl SnapshotPublisher {
    pub fn new(publication: Box<dyn Publication>) -> Self {
        Self {
            publication,
            buffer: Vec::new(),
        }
    }

    /// Publisher over a datagram socket aimed at `config`.
    pub fn connect(config: &ChannelConfig) -> Result<Self> {
        Ok(Self::new(Box::new(UdpPublication::connect(config)?)))
    }
}

impl SnapshotConsumer for SnapshotPublisher {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let length = encode_snapshot(snapshot, &mut self.buffer);

        let mut remaining = SEND_RETRY_LIMIT;
        loop {
            match self.publication.offer(&self.buffer[..length]) {
                Offer::Accepted => return Ok(()),
                Offer::Closed => bail!("snapshot publication closed"),
                Offer::Backpressured => {
                    remaining -= 1;
                    if remaining == 0 {
                        debug!(
                            context = %snapshot.context,
                            "snapshot dropped after backpressure",
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Polls a subscription and feeds decoded snapshots to a consumer.
pub struct SnapshotSubscriber {
    subscription: Box<dyn Subscription>,
    consumer: Box<dyn SnapshotConsumer>,
}

impl SnapshotSubscriber {
    pub fn new(subscription: Box<dyn Subscription>, consumer: Box<dyn SnapshotConsumer>) -> Self {
        Self {
            subscription,
            consumer,
        }
    }

    /// Subscriber over a datagram socket bound per `config`.
    pub fn bind(config: &ChannelConfig, consumer: Box<dyn SnapshotConsumer>) -> Result<Self> {
        Ok(Self::new(
            Box::new(UdpSubscription::bind(config)?),
            consumer,
        ))
    }

    /// Poll a bounded number of frames; returns how many were handled.
    ///
    /// A frame that fails to decode is a hard error, as is any error
    /// returned by the consumer.
    pub fn do_work(&mut self) -> Result<usize> {
        let consumer = &mut self.consumer;
        self.subscription.poll(
            &mut |payload| {
                let snapshot = decode_snapshot(payload).context("decoding snapshot frame")?;
                consumer.on_snapshot(&snapshot)
            },
            POLL_LIMIT,
        )
    }
}
