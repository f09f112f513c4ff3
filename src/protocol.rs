/// Record types carried in ESP-NOW frames and their plaintext encoding.
///
/// Frame layout on the air (see `codec` for the cipher):
///
/// ```text
/// [kind: 1][sequence: 4 LE][nonce: 8][ciphertext: variable][tag: 16]
/// ```
///
/// Plaintext schema, in order:
///
/// ```text
/// version: u8 (= 1)
/// hostname: u8 length + bytes
/// mac: 6 bytes
/// display name: u8 length + bytes
/// sensor:    flags u8, temperature i16 LE, humidity u16 LE, battery u8
/// heartbeat: uptime u32 LE (seconds), dropped u32 LE
/// ```
///
/// All buffers are `heapless`, no allocator.
use heapless::Vec;

use crate::config::HostString;
use crate::mac::MacAddress;
use crate::policy::{NameString, MAX_NAME_LEN};
use crate::scanner::{BatteryPercent, CentiCelsius, CentiPercent, Measurement};

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plaintext schema version, checked as a structural marker on decode
pub const PLAINTEXT_VERSION: u8 = 1;

/// Size of the session nonce carried in the header
pub const NONCE_LEN: usize = 8;

/// Header: kind + sequence + nonce
pub const HEADER_LEN: usize = 1 + 4 + NONCE_LEN;

/// Poly1305 authentication tag
pub const TAG_LEN: usize = 16;

/// ESP-NOW maximum payload
pub const MAX_FRAME_LEN: usize = 250;

/// Largest plaintext a frame can carry
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - HEADER_LEN - TAG_LEN;

/// Serialized + encrypted frame as placed on the air
pub type WireFrame = Vec<u8, MAX_FRAME_LEN>;

/// Plaintext record buffer
pub type PlaintextBuffer = Vec<u8, MAX_PLAINTEXT_LEN>;

const FLAG_TEMPERATURE: u8 = 1 << 0;
const FLAG_HUMIDITY: u8 = 1 << 1;
const FLAG_BATTERY: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    SensorRelay = 0x01,
    Heartbeat = 0x02,
}

impl RecordKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::SensorRelay),
            0x02 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded sensor reading from an admitted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub mac: MacAddress,
    /// Renamed label, or the canonical MAC when no rename applies
    pub name: NameString,
    pub measurement: Measurement,
}

/// Liveness report from a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Station MAC of the reporting proxy
    pub mac: MacAddress,
    pub uptime_secs: u32,
    /// Frames that never reached the air
    pub dropped: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sensor(SensorReading),
    Heartbeat(Heartbeat),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Sensor(_) => RecordKind::SensorRelay,
            Record::Heartbeat(_) => RecordKind::Heartbeat,
        }
    }
}

/// Sequence number from a frame header, without decrypting
pub fn frame_sequence(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = frame.get(1..5)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Plaintext structure could not be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    UnsupportedVersion(u8),
    Malformed(&'static str),
}

/// Plaintext would not fit into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Serialize `record` from `hostname` into `out`.
pub fn write_record(
    hostname: &str,
    record: &Record,
    out: &mut PlaintextBuffer,
) -> Result<(), Overflow> {
    out.clear();
    push(out, &[PLAINTEXT_VERSION])?;
    push_str(out, hostname)?;

    match record {
        Record::Sensor(reading) => {
            push(out, reading.mac.octets())?;
            push_str(out, &reading.name)?;

            let m = &reading.measurement;
            let mut flags = 0u8;
            if m.temperature.is_some() {
                flags |= FLAG_TEMPERATURE;
            }
            if m.humidity.is_some() {
                flags |= FLAG_HUMIDITY;
            }
            if m.battery.is_some() {
                flags |= FLAG_BATTERY;
            }
            push(out, &[flags])?;
            push(out, &m.temperature.map_or(0, |t| t.0).to_le_bytes())?;
            push(out, &m.humidity.map_or(0, |h| h.0).to_le_bytes())?;
            push(out, &[m.battery.map_or(0, |b| b.0)])?;
        }
        Record::Heartbeat(hb) => {
            push(out, hb.mac.octets())?;
            // Heartbeats are labeled with the proxy's own hostname
            push_str(out, hostname)?;
            push(out, &hb.uptime_secs.to_le_bytes())?;
            push(out, &hb.dropped.to_le_bytes())?;
        }
    }

    Ok(())
}

/// Parse a plaintext record of the given kind.
///
/// Returns the sender hostname and the record. Trailing bytes are rejected.
pub fn read_record(kind: RecordKind, data: &[u8]) -> Result<(HostString, Record), ParseError> {
    let mut r = Reader::new(data);

    let version = r.u8()?;
    if version != PLAINTEXT_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let hostname = r.string()?;
    let mac = MacAddress(r.array::<6>()?);
    let name = r.string()?;

    let record = match kind {
        RecordKind::SensorRelay => {
            let flags = r.u8()?;
            if flags & !(FLAG_TEMPERATURE | FLAG_HUMIDITY | FLAG_BATTERY) != 0 {
                return Err(ParseError::Malformed("unknown measurement flags"));
            }
            let temperature = i16::from_le_bytes(r.array::<2>()?);
            let humidity = u16::from_le_bytes(r.array::<2>()?);
            let battery = r.u8()?;

            let measurement = Measurement {
                temperature: (flags & FLAG_TEMPERATURE != 0).then_some(CentiCelsius(temperature)),
                humidity: (flags & FLAG_HUMIDITY != 0).then_some(CentiPercent(humidity)),
                battery: (flags & FLAG_BATTERY != 0).then_some(BatteryPercent(battery)),
            };
            Record::Sensor(SensorReading {
                mac,
                name,
                measurement,
            })
        }
        RecordKind::Heartbeat => {
            let uptime_secs = u32::from_le_bytes(r.array::<4>()?);
            let dropped = u32::from_le_bytes(r.array::<4>()?);
            Record::Heartbeat(Heartbeat {
                mac,
                uptime_secs,
                dropped,
            })
        }
    };

    if !r.is_empty() {
        return Err(ParseError::Malformed("trailing bytes"));
    }

    Ok((hostname, record))
}

fn push(out: &mut PlaintextBuffer, bytes: &[u8]) -> Result<(), Overflow> {
    out.extend_from_slice(bytes).map_err(|_| Overflow)
}

fn push_str(out: &mut PlaintextBuffer, s: &str) -> Result<(), Overflow> {
    if s.len() > MAX_NAME_LEN {
        return Err(Overflow);
    }
    push(out, &[s.len() as u8])?;
    push(out, s.as_bytes())
}

/// Bounds-checked cursor over a plaintext buffer
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.data.len() < n {
            return Err(ParseError::Malformed("truncated plaintext"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<NameString, ParseError> {
        let len = self.u8()? as usize;
        if len > MAX_NAME_LEN {
            return Err(ParseError::Malformed("string too long"));
        }
        let bytes = self.take(len)?;
        let s = core::str::from_utf8(bytes).map_err(|_| ParseError::Malformed("invalid utf-8"))?;
        NameString::try_from(s).map_err(|_| ParseError::Malformed("string too long"))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
