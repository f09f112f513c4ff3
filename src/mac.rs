/// 6-byte hardware addresses for BLE devices and ESP-NOW peers.
///
/// The canonical text form is lower-case colon-separated hex
/// ("aa:bb:cc:dd:ee:ff"). Parsing accepts either case.
use core::fmt;
use core::str::FromStr;

use heapless::String;

/// Maximum length of a MAC address string ("aa:bb:cc:dd:ee:ff")
pub type MacString = String<17>;

/// The ESP-NOW broadcast address
pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn octets(&self) -> &[u8; 6] {
        &self.0
    }

    /// Canonical lower-case string form.
    pub fn to_mac_string(&self) -> MacString {
        use core::fmt::Write;
        let mut s = MacString::new();
        let _ = write!(s, "{}", self);
        s
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address")]
pub struct ParseMacError;

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 17 {
            return Err(ParseMacError);
        }
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or(ParseMacError)?;
            if part.len() != 2 {
                return Err(ParseMacError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError)?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError);
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lower_case_colon_hex() {
        let mac = MacAddress([0xAA, 0xBB, 0xCC, 0x0D, 0xEE, 0xFF]);
        assert_eq!(mac.to_mac_string().as_str(), "aa:bb:cc:0d:ee:ff");
    }

    #[test]
    fn parse_accepts_either_case() {
        let upper: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let lower: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.octets(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn parse_trims_whitespace() {
        let mac: MacAddress = " 11:22:33:44:55:66 ".parse().unwrap();
        assert_eq!(mac, MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "11:22:33:44:55",
            "11:22:33:44:55:66:77",
            "11-22-33-44-55-66",
            "11:22:33:44:55:6g",
            "1:222:33:44:55:66",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "'{bad}' should not parse");
        }
    }

    #[test]
    fn canonical_string_round_trips() {
        let mac = MacAddress([0x01, 0x02, 0x03, 0xa4, 0xb5, 0xc6]);
        let parsed: MacAddress = mac.to_mac_string().parse().unwrap();
        assert_eq!(parsed, mac);
    }

    #[test]
    fn broadcast_is_all_ones() {
        assert_eq!(BROADCAST.to_mac_string().as_str(), "ff:ff:ff:ff:ff:ff");
    }
}
