/// BLE scan inputs and the sensor-decoding seam.
///
/// The platform's BLE stack delivers every scanned advertisement as an
/// [`Advertisement`]; vendor payload decoding is delegated to a
/// [`SensorDecoder`]. [`ServiceDataDecoder`] handles the common
/// thermometer service-data layout.
use heapless::Vec;

use crate::mac::MacAddress;

/// Maximum advertisement payload kept (advertising data + scan response,
/// or one extended advertising PDU)
pub const MAX_ADV_LEN: usize = 255;

/// Raw advertisement payload bytes
pub type AdvPayload = Vec<u8, MAX_ADV_LEN>;

/// BLE advertiser address type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Public,
    Random,
}

/// A raw BLE advertisement, valid for one scan callback
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub mac: MacAddress,
    pub address_kind: AddressKind,
    /// Informational only
    pub rssi: i8,
    pub payload: AdvPayload,
}

impl Advertisement {
    /// Build an advertisement, truncating payloads longer than [`MAX_ADV_LEN`].
    pub fn new(mac: MacAddress, address_kind: AddressKind, rssi: i8, data: &[u8]) -> Self {
        let mut payload = AdvPayload::new();
        let _ = payload.extend_from_slice(&data[..data.len().min(MAX_ADV_LEN)]);
        Self {
            mac,
            address_kind,
            rssi,
            payload,
        }
    }
}

/// Temperature in hundredths of a degree Celsius
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CentiCelsius(pub i16);

/// Relative humidity in hundredths of a percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CentiPercent(pub u16);

/// Battery level in whole percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatteryPercent(pub u8);

/// Values decoded from one sensor advertisement. Fields a sensor does not
/// report are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurement {
    pub temperature: Option<CentiCelsius>,
    pub humidity: Option<CentiPercent>,
    pub battery: Option<BatteryPercent>,
}

impl Measurement {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.battery.is_none()
    }
}

/// Vendor payload decoder.
///
/// Returns `None` for advertisements it does not recognize. Called from the
/// scan path, so it must be bounded-time and must not block.
pub trait SensorDecoder {
    fn decode(&self, adv: &Advertisement) -> Option<Measurement>;
}

impl<D: SensorDecoder + ?Sized> SensorDecoder for &D {
    fn decode(&self, adv: &Advertisement) -> Option<Measurement> {
        (**self).decode(adv)
    }
}

/// AD type: Service Data - 16-bit UUID
const AD_SERVICE_DATA_16: u8 = 0x16;

/// Product marker at offset 5 of the service data body
const SENSOR_MARKER: u8 = 0x02;

/// Decoder for thermometers that broadcast readings as 16-bit UUID service
/// data.
///
/// Service data body (after the 2-byte UUID):
///   [4]     battery %
///   [5]     marker, must be 0x02
///   [6..8]  temperature, i16 LE, 0.01 °C
///   [9..11] humidity, u16 LE, 0.01 % (optional)
///
/// Every service data structure in the payload is tried; the first that
/// matches wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceDataDecoder;

impl ServiceDataDecoder {
    fn decode_body(body: &[u8]) -> Option<Measurement> {
        if body.len() < 8 || body[5] != SENSOR_MARKER {
            return None;
        }
        Some(Measurement {
            temperature: Some(CentiCelsius(i16::from_le_bytes([body[6], body[7]]))),
            humidity: body
                .get(9..11)
                .map(|h| CentiPercent(u16::from_le_bytes([h[0], h[1]]))),
            battery: Some(BatteryPercent(body[4])),
        })
    }
}

impl SensorDecoder for ServiceDataDecoder {
    fn decode(&self, adv: &Advertisement) -> Option<Measurement> {
        let ad_data = adv.payload.as_slice();
        let mut pos = 0;
        while pos < ad_data.len() {
            let len = ad_data[pos] as usize;
            if len == 0 || pos + 1 + len > ad_data.len() {
                break;
            }

            let ad_type = ad_data[pos + 1];
            let data = &ad_data[pos + 2..pos + 1 + len];

            if ad_type == AD_SERVICE_DATA_16 && data.len() > 2 {
                if let Some(m) = Self::decode_body(&data[2..]) {
                    return Some(m);
                }
            }

            pos += 1 + len;
        }
        None
    }
}
