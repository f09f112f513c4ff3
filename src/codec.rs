/// Frame sealing and opening.
///
/// Records are serialized by `protocol` and encrypted in place with
/// ChaCha20-Poly1305. The 13-byte header is authenticated as associated data.
/// The key is SHA-256 over a domain label and the configured secret, so any
/// secret length works.
///
/// Cipher nonce (96 bits): `session salt (8 LE) || sequence (4 LE)`.
/// The salt is drawn from the hardware RNG at boot and carried in the header;
/// the sequence starts at 0 per boot and never wraps.
///
/// Receivers track a sliding replay window per sender session because
/// ESP-NOW delivery is unordered and lossy.
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce, Tag};
use heapless::Vec;
use sha2::{Digest, Sha256};

use crate::config::HostString;
use crate::protocol::{
    self, ParseError, PlaintextBuffer, Record, RecordKind, WireFrame, HEADER_LEN, NONCE_LEN,
    TAG_LEN,
};

/// Domain label mixed into the key derivation
const KEY_LABEL: &[u8] = b"espnow-ble-proxy/v1";

/// How far behind the newest sequence a frame may arrive and still be accepted
pub const REPLAY_WINDOW: u32 = 32;

/// Sender sessions tracked by a receiver
pub const MAX_SESSIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short ({0} bytes)")]
    Truncated(usize),
    #[error("frame longer than the radio allows ({0} bytes)")]
    Oversized(usize),
    #[error("unknown record kind {0:#04x}")]
    UnknownKind(u8),
    #[error("authentication failed")]
    Authentication,
    #[error("unsupported plaintext version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed plaintext: {0}")]
    Malformed(&'static str),
    #[error("sequence {0} already received")]
    Replayed(u32),
    #[error("sequence {0} is outside the replay window")]
    Stale(u32),
}

impl From<ParseError> for DecodeError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::UnsupportedVersion(v) => Self::UnsupportedVersion(v),
            ParseError::Malformed(what) => Self::Malformed(what),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("record does not fit in a frame")]
    Overflow,
    #[error("cipher failure")]
    Cipher,
    #[error("sequence counter exhausted")]
    SequenceExhausted,
}

/// A successfully opened frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub kind: RecordKind,
    pub sequence: u32,
    /// Sender's per-boot session salt
    pub session: u64,
    pub hostname: HostString,
    pub record: Record,
}

/// Sliding-window duplicate and reorder filter.
///
/// Bit `i` of `seen` records whether `highest - i` has been accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    highest: u32,
    seen: u32,
}

impl ReplayWindow {
    pub const fn starting_at(sequence: u32) -> Self {
        Self {
            highest: sequence,
            seen: 1,
        }
    }

    pub fn highest(&self) -> u32 {
        self.highest
    }

    /// Would `sequence` be accepted? Does not update the window.
    pub fn check(&self, sequence: u32) -> Result<(), DecodeError> {
        if sequence > self.highest {
            return Ok(());
        }
        let offset = self.highest - sequence;
        if offset >= REPLAY_WINDOW {
            return Err(DecodeError::Stale(sequence));
        }
        if self.seen & (1 << offset) != 0 {
            return Err(DecodeError::Replayed(sequence));
        }
        Ok(())
    }

    /// Record `sequence` as received. Call only after [`check`](Self::check)
    /// and authentication succeeded.
    pub fn accept(&mut self, sequence: u32) {
        if sequence > self.highest {
            let shift = sequence - self.highest;
            self.seen = if shift >= REPLAY_WINDOW {
                0
            } else {
                self.seen << shift
            };
            self.seen |= 1;
            self.highest = sequence;
        } else {
            let offset = self.highest - sequence;
            if offset < REPLAY_WINDOW {
                self.seen |= 1 << offset;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Session {
    salt: u64,
    window: ReplayWindow,
    /// Order of first contact, for eviction
    opened: u32,
}

/// Symmetric frame codec for one proxy.
///
/// Owns the transmit sequence counter and the receive-side replay state.
/// Single writer: used only from the proxy's event loop.
pub struct PayloadCodec {
    cipher: ChaCha20Poly1305,
    salt: u64,
    next_sequence: Option<u32>,
    sessions: Vec<Session, MAX_SESSIONS>,
    sessions_opened: u32,
}

impl PayloadCodec {
    /// `boot_salt` must be freshly random for every boot.
    pub fn new(secret: &[u8], boot_salt: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_LABEL);
        hasher.update(secret);
        let key = hasher.finalize();

        Self {
            cipher: ChaCha20Poly1305::new(&key),
            salt: boot_salt,
            next_sequence: Some(0),
            sessions: Vec::new(),
            sessions_opened: 0,
        }
    }

    pub fn session(&self) -> u64 {
        self.salt
    }

    /// Sequence the next encoded frame will carry, if any remain
    pub fn next_sequence(&self) -> Option<u32> {
        self.next_sequence
    }

    /// Serialize and encrypt `record`. Consumes one sequence number.
    pub fn encode(&mut self, hostname: &str, record: &Record) -> Result<WireFrame, EncodeError> {
        let sequence = self.next_sequence.ok_or(EncodeError::SequenceExhausted)?;

        let mut plaintext = PlaintextBuffer::new();
        protocol::write_record(hostname, record, &mut plaintext)
            .map_err(|_| EncodeError::Overflow)?;

        let mut frame = WireFrame::new();
        let header = header_bytes(record.kind(), sequence, self.salt);
        frame
            .extend_from_slice(&header)
            .map_err(|_| EncodeError::Overflow)?;
        frame
            .extend_from_slice(&plaintext)
            .map_err(|_| EncodeError::Overflow)?;

        let nonce = nonce_bytes(self.salt, sequence);
        let tag = self
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &header,
                &mut frame[HEADER_LEN..],
            )
            .map_err(|_| EncodeError::Cipher)?;
        frame
            .extend_from_slice(tag.as_slice())
            .map_err(|_| EncodeError::Overflow)?;

        self.next_sequence = sequence.checked_add(1);
        Ok(frame)
    }

    /// Authenticate, decrypt and parse a frame.
    ///
    /// Replay state is only updated for frames that authenticate and parse.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<DecodedFrame, DecodeError> {
        if bytes.len() < HEADER_LEN + TAG_LEN {
            return Err(DecodeError::Truncated(bytes.len()));
        }
        if bytes.len() > protocol::MAX_FRAME_LEN {
            return Err(DecodeError::Oversized(bytes.len()));
        }

        let kind = RecordKind::from_byte(bytes[0]).ok_or(DecodeError::UnknownKind(bytes[0]))?;
        let sequence = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut salt = [0u8; NONCE_LEN];
        salt.copy_from_slice(&bytes[5..HEADER_LEN]);
        let session = u64::from_le_bytes(salt);

        if let Some(s) = self.sessions.iter().find(|s| s.salt == session) {
            s.window.check(sequence)?;
        }

        let (header, rest) = bytes.split_at(HEADER_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut plaintext = PlaintextBuffer::new();
        plaintext
            .extend_from_slice(ciphertext)
            .map_err(|_| DecodeError::Oversized(bytes.len()))?;

        let nonce = nonce_bytes(session, sequence);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                header,
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| DecodeError::Authentication)?;

        let (hostname, record) = protocol::read_record(kind, &plaintext)?;

        self.accept(session, sequence);

        Ok(DecodedFrame {
            kind,
            sequence,
            session,
            hostname,
            record,
        })
    }

    fn accept(&mut self, salt: u64, sequence: u32) {
        if let Some(s) = self.sessions.iter_mut().find(|s| s.salt == salt) {
            s.window.accept(sequence);
            return;
        }

        if self.sessions.is_full() {
            if let Some(oldest) = self
                .sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.opened)
                .map(|(i, _)| i)
            {
                self.sessions.swap_remove(oldest);
            }
        }

        let session = Session {
            salt,
            window: ReplayWindow::starting_at(sequence),
            opened: self.sessions_opened,
        };
        self.sessions_opened = self.sessions_opened.wrapping_add(1);
        let _ = self.sessions.push(session);
        log::debug!("Opened receive session {:016x} at sequence {}", salt, sequence);
    }

    #[cfg(test)]
    pub(crate) fn set_next_sequence(&mut self, sequence: Option<u32>) {
        self.next_sequence = sequence;
    }
}

fn header_bytes(kind: RecordKind, sequence: u32, salt: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = kind as u8;
    header[1..5].copy_from_slice(&sequence.to_le_bytes());
    header[5..HEADER_LEN].copy_from_slice(&salt.to_le_bytes());
    header
}

fn nonce_bytes(salt: u64, sequence: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_LEN].copy_from_slice(&salt.to_le_bytes());
    nonce[NONCE_LEN..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddress;
    use crate::policy::NameString;
    use crate::protocol::{Heartbeat, SensorReading};
    use crate::scanner::{BatteryPercent, CentiCelsius, CentiPercent, Measurement};

    const KEY: &[u8] = b"0123456789abcdef";

    fn reading() -> Record {
        Record::Sensor(SensorReading {
            mac: "a4:c1:38:11:22:33".parse().unwrap(),
            name: NameString::try_from("Bedroom").unwrap(),
            measurement: Measurement {
                temperature: Some(CentiCelsius(2150)),
                humidity: Some(CentiPercent(4520)),
                battery: Some(BatteryPercent(93)),
            },
        })
    }

    #[test]
    fn round_trip_sensor() {
        let mut tx = PayloadCodec::new(KEY, 0xdead_beef);
        let mut rx = PayloadCodec::new(KEY, 7);
        let frame = tx.encode("proxy", &reading()).unwrap();
        let decoded = rx.decode(&frame).unwrap();
        assert_eq!(decoded.kind, RecordKind::SensorRelay);
        assert_eq!(decoded.record, reading());
        assert_eq!(decoded.hostname.as_str(), "proxy");
        assert_eq!(decoded.session, 0xdead_beef);
        assert_eq!(decoded.sequence, 0);
    }

    #[test]
    fn round_trip_same_instance() {
        let mut codec = PayloadCodec::new(KEY, 1);
        let frame = codec.encode("proxy", &reading()).unwrap();
        assert_eq!(codec.decode(&frame).unwrap().record, reading());
    }

    #[test]
    fn round_trip_heartbeat() {
        let hb = Record::Heartbeat(Heartbeat {
            mac: MacAddress([1, 2, 3, 4, 5, 6]),
            uptime_secs: 3600,
            dropped: 2,
        });
        let mut tx = PayloadCodec::new(KEY, 1);
        let mut rx = PayloadCodec::new(KEY, 2);
        let frame = tx.encode("proxy", &hb).unwrap();
        assert_eq!(frame[0], RecordKind::Heartbeat as u8);
        let decoded = rx.decode(&frame).unwrap();
        assert_eq!(decoded.kind, RecordKind::Heartbeat);
        assert_eq!(decoded.record, hb);
    }

    #[test]
    fn header_layout() {
        let mut tx = PayloadCodec::new(KEY, 0x0807_0605_0403_0201);
        tx.encode("proxy", &reading()).unwrap();
        let frame = tx.encode("proxy", &reading()).unwrap();
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..5], &[1, 0, 0, 0]);
        assert_eq!(&frame[5..13], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // version + hostname + mac + name + measurement, then the tag
        let plaintext_len = 1 + 1 + 5 + 6 + 1 + 7 + 6;
        assert_eq!(frame.len(), HEADER_LEN + plaintext_len + TAG_LEN);
    }

    #[test]
    fn sequence_increments_by_one() {
        let mut tx = PayloadCodec::new(KEY, 9);
        let mut rx = PayloadCodec::new(KEY, 10);
        let a = rx.decode(&tx.encode("p", &reading()).unwrap()).unwrap();
        let b = rx.decode(&tx.encode("p", &reading()).unwrap()).unwrap();
        assert_eq!(b.sequence, a.sequence + 1);
        assert_eq!(tx.next_sequence(), Some(2));
    }

    #[test]
    fn ciphertext_hides_plaintext() {
        let mut tx = PayloadCodec::new(KEY, 9);
        let frame = tx.encode("proxy", &reading()).unwrap();
        let body = &frame[HEADER_LEN..];
        assert!(!body.windows(7).any(|w| w == b"Bedroom"));
    }

    #[test]
    fn tamper_any_bit_fails() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let frame = tx.encode("proxy", &reading()).unwrap();

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                let mut rx = PayloadCodec::new(KEY, 4);
                assert!(
                    rx.decode(&tampered).is_err(),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }

        let mut rx = PayloadCodec::new(KEY, 4);
        assert!(rx.decode(&frame).is_ok());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut rx = PayloadCodec::new(b"another key", 4);
        let frame = tx.encode("proxy", &reading()).unwrap();
        assert_eq!(rx.decode(&frame), Err(DecodeError::Authentication));
    }

    #[test]
    fn short_frame_is_truncated() {
        let mut rx = PayloadCodec::new(KEY, 4);
        assert_eq!(rx.decode(&[1, 0, 0]), Err(DecodeError::Truncated(3)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut rx = PayloadCodec::new(KEY, 4);
        let bytes = [0x01u8; protocol::MAX_FRAME_LEN + 1];
        assert_eq!(
            rx.decode(&bytes),
            Err(DecodeError::Oversized(protocol::MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut frame = tx.encode("proxy", &reading()).unwrap();
        frame[0] = 0x7f;
        let mut rx = PayloadCodec::new(KEY, 4);
        assert_eq!(rx.decode(&frame), Err(DecodeError::UnknownKind(0x7f)));
    }

    #[test]
    fn duplicate_frame_is_replayed() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut rx = PayloadCodec::new(KEY, 4);
        let frame = tx.encode("proxy", &reading()).unwrap();
        rx.decode(&frame).unwrap();
        assert_eq!(rx.decode(&frame), Err(DecodeError::Replayed(0)));
    }

    #[test]
    fn reordered_frames_within_window_accepted() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut rx = PayloadCodec::new(KEY, 4);
        let frames: std::vec::Vec<WireFrame> = (0..5)
            .map(|_| tx.encode("proxy", &reading()).unwrap())
            .collect();

        for i in [4usize, 0, 2, 1, 3] {
            assert_eq!(rx.decode(&frames[i]).unwrap().sequence, i as u32);
        }
    }

    #[test]
    fn frames_beyond_window_are_stale() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut rx = PayloadCodec::new(KEY, 4);
        let old = tx.encode("proxy", &reading()).unwrap();
        tx.set_next_sequence(Some(REPLAY_WINDOW + 5));
        rx.decode(&tx.encode("proxy", &reading()).unwrap()).unwrap();
        assert_eq!(rx.decode(&old), Err(DecodeError::Stale(0)));
    }

    #[test]
    fn forged_frame_does_not_advance_window() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let mut rx = PayloadCodec::new(KEY, 4);
        let first = tx.encode("proxy", &reading()).unwrap();
        rx.decode(&first).unwrap();

        // Forged header claiming a far-ahead sequence
        let mut forged = tx.encode("proxy", &reading()).unwrap();
        forged[1..5].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(rx.decode(&forged), Err(DecodeError::Authentication));

        let second = tx.encode("proxy", &reading()).unwrap();
        assert!(rx.decode(&second).is_ok());
    }

    #[test]
    fn sender_reboot_opens_new_session() {
        let mut rx = PayloadCodec::new(KEY, 99);
        let mut before = PayloadCodec::new(KEY, 1);
        for _ in 0..3 {
            rx.decode(&before.encode("proxy", &reading()).unwrap()).unwrap();
        }
        // Same sender after reboot: sequence restarts at 0 with a new salt
        let mut after = PayloadCodec::new(KEY, 2);
        let decoded = rx.decode(&after.encode("proxy", &reading()).unwrap()).unwrap();
        assert_eq!(decoded.sequence, 0);
        assert_eq!(decoded.session, 2);
    }

    #[test]
    fn full_width_salt_separates_sessions() {
        // Salts equal in their low 32 bits must still yield distinct nonces
        let mut a = PayloadCodec::new(KEY, 0x0000_0001_dead_beef);
        let mut b = PayloadCodec::new(KEY, 0x0000_0002_dead_beef);
        let fa = a.encode("proxy", &reading()).unwrap();
        let fb = b.encode("proxy", &reading()).unwrap();
        assert_ne!(&fa[HEADER_LEN..], &fb[HEADER_LEN..]);

        let mut rx = PayloadCodec::new(KEY, 7);
        assert_eq!(rx.decode(&fa).unwrap().session, 0x0000_0001_dead_beef);
        assert_eq!(rx.decode(&fb).unwrap().session, 0x0000_0002_dead_beef);
    }

    #[test]
    fn oldest_session_evicted() {
        let mut rx = PayloadCodec::new(KEY, 0);
        let mut first = PayloadCodec::new(KEY, 1000);
        let frame = first.encode("proxy", &reading()).unwrap();
        rx.decode(&frame).unwrap();

        for salt in 0..MAX_SESSIONS as u64 {
            let mut tx = PayloadCodec::new(KEY, salt + 1);
            rx.decode(&tx.encode("proxy", &reading()).unwrap()).unwrap();
        }

        // Session 1000 was evicted, so its replay history is gone
        assert!(rx.decode(&frame).is_ok());
    }

    #[test]
    fn exhausted_sequence_refuses_to_encode() {
        let mut tx = PayloadCodec::new(KEY, 3);
        tx.set_next_sequence(Some(u32::MAX));
        assert!(tx.encode("proxy", &reading()).is_ok());
        assert_eq!(
            tx.encode("proxy", &reading()),
            Err(EncodeError::SequenceExhausted)
        );
    }

    #[test]
    fn overlong_hostname_is_overflow() {
        let mut tx = PayloadCodec::new(KEY, 3);
        let host = "h".repeat(40);
        assert_eq!(tx.encode(&host, &reading()), Err(EncodeError::Overflow));
        // Failed encodes do not consume a sequence number
        assert_eq!(tx.next_sequence(), Some(0));
    }

    #[test]
    fn replay_window_bookkeeping() {
        let mut w = ReplayWindow::starting_at(10);
        assert_eq!(w.check(10), Err(DecodeError::Replayed(10)));
        assert!(w.check(9).is_ok());
        w.accept(9);
        assert_eq!(w.check(9), Err(DecodeError::Replayed(9)));
        w.accept(50);
        assert_eq!(w.highest(), 50);
        assert_eq!(w.check(10), Err(DecodeError::Stale(10)));
        assert!(w.check(19).is_ok());
        assert_eq!(w.check(18), Err(DecodeError::Stale(18)));
    }
}
