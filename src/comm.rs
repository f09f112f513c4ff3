/// Communication layer: ESP-NOW style connectionless broadcast.
///
/// [`Radio`] is the platform primitive (peer table, transmit queue, receive
/// callback). [`BroadcastTransport`] wraps it with the single-peer discipline
/// and maps driver errors onto [`SendResult`]. [`Uplink`] pairs the transport
/// with the frame codec so sensor relays and heartbeats share one path.
///
/// Delivery is best-effort: no acknowledgment, no retry. A send that would
/// block fails fast instead.
use crate::codec::{EncodeError, PayloadCodec};
use crate::mac::MacAddress;
use crate::protocol::{self, Record};

/// Errors reported by the platform radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("transmit queue full")]
    QueueFull,
    #[error("radio busy")]
    Busy,
    #[error("peer not registered")]
    UnknownPeer,
    #[error("driver error {0}")]
    Driver(i32),
}

/// Connectionless peer-to-peer radio primitive.
///
/// `transmit` must only enqueue: it returns immediately and never waits for
/// the frame to leave the air.
pub trait Radio {
    fn add_peer(&mut self, peer: &MacAddress) -> Result<(), RadioError>;

    fn transmit(&mut self, peer: &MacAddress, frame: &[u8]) -> Result<(), RadioError>;

    /// Install the receive callback. It is invoked from the radio driver's
    /// context and must not block.
    fn set_receive_callback<F>(&mut self, callback: F) -> Result<(), RadioError>
    where
        F: FnMut(&MacAddress, &[u8]) + Send + 'static;
}

/// Outcome of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    QueuedFull,
    PeerUnknown,
    RadioBusy,
}

impl SendResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendResult::Ok => "ok",
            SendResult::QueuedFull => "queued_full",
            SendResult::PeerUnknown => "peer_unknown",
            SendResult::RadioBusy => "radio_busy",
        }
    }
}

impl From<RadioError> for SendResult {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::QueueFull => SendResult::QueuedFull,
            RadioError::UnknownPeer => SendResult::PeerUnknown,
            RadioError::Busy | RadioError::Driver(_) => SendResult::RadioBusy,
        }
    }
}

/// Single-peer broadcast wrapper over a [`Radio`].
pub struct BroadcastTransport<R> {
    radio: R,
    peer: Option<MacAddress>,
}

impl<R: Radio> BroadcastTransport<R> {
    pub fn new(radio: R) -> Self {
        Self { radio, peer: None }
    }

    /// Register the broadcast peer. Only one peer is supported; registering
    /// a different address once a peer is set fails.
    pub fn register_peer(&mut self, address: MacAddress) -> bool {
        match self.peer {
            Some(existing) if existing == address => return true,
            Some(existing) => {
                log::error!(
                    "Peer slot already holds {}, cannot register {}",
                    existing,
                    address
                );
                return false;
            }
            None => {}
        }

        match self.radio.add_peer(&address) {
            Ok(()) => {
                log::info!("Registered ESP-NOW peer {}", address);
                self.peer = Some(address);
                true
            }
            Err(e) => {
                log::error!("Failed to add peer {}: {}", address, e);
                false
            }
        }
    }

    pub fn peer(&self) -> Option<MacAddress> {
        self.peer
    }

    /// Fire-and-forget send of one frame.
    pub fn send(&mut self, bytes: &[u8], peer: &MacAddress) -> SendResult {
        if self.peer.as_ref() != Some(peer) {
            return SendResult::PeerUnknown;
        }
        match self.radio.transmit(peer, bytes) {
            Ok(()) => SendResult::Ok,
            Err(e) => e.into(),
        }
    }

    pub fn on_receive<F>(&mut self, callback: F) -> bool
    where
        F: FnMut(&MacAddress, &[u8]) + Send + 'static,
    {
        match self.radio.set_receive_callback(callback) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to register receive callback: {}", e);
                false
            }
        }
    }
}

/// Failure counters for outbound frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub sent: u32,
    pub queued_full: u32,
    pub peer_unknown: u32,
    pub radio_busy: u32,
    pub encode_failed: u32,
}

impl SendStats {
    /// Frames that never reached the air
    pub fn dropped(&self) -> u32 {
        self.queued_full
            .saturating_add(self.peer_unknown)
            .saturating_add(self.radio_busy)
            .saturating_add(self.encode_failed)
    }

    fn record(&mut self, result: SendResult) {
        let counter = match result {
            SendResult::Ok => &mut self.sent,
            SendResult::QueuedFull => &mut self.queued_full,
            SendResult::PeerUnknown => &mut self.peer_unknown,
            SendResult::RadioBusy => &mut self.radio_busy,
        };
        *counter = counter.saturating_add(1);
    }
}

/// Why a record did not go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    Encode(EncodeError),
    Send(SendResult),
}

/// Encode + send path shared by sensor relays and heartbeats.
pub struct Uplink<R> {
    codec: PayloadCodec,
    transport: BroadcastTransport<R>,
    peer: MacAddress,
    stats: SendStats,
}

impl<R: Radio> Uplink<R> {
    pub fn new(codec: PayloadCodec, transport: BroadcastTransport<R>, peer: MacAddress) -> Self {
        Self {
            codec,
            transport,
            peer,
            stats: SendStats::default(),
        }
    }

    /// Encode `record` and hand it to the radio. Returns the frame's sequence
    /// number on success. Failures are counted, never retried.
    pub fn send(&mut self, hostname: &str, record: &Record) -> Result<u32, RelayError> {
        let frame = match self.codec.encode(hostname, record) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.encode_failed = self.stats.encode_failed.saturating_add(1);
                return Err(RelayError::Encode(e));
            }
        };

        let result = self.transport.send(&frame, &self.peer);
        self.stats.record(result);
        match result {
            SendResult::Ok => Ok(protocol::frame_sequence(&frame).unwrap_or_default()),
            failure => Err(RelayError::Send(failure)),
        }
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    pub fn codec_mut(&mut self) -> &mut PayloadCodec {
        &mut self.codec
    }

    pub fn transport_mut(&mut self) -> &mut BroadcastTransport<R> {
        &mut self.transport
    }
}
