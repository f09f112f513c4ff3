/// Proxy configuration, immutable after startup.
///
/// Built either programmatically through [`ProxyConfigBuilder`] or from the
/// JSON document the firmware embeds at build time ([`ProxyConfig::from_json`]).
/// Every optional field has a stated default: intervals of zero are disabled,
/// empty MAC lists mean no restriction.
use core::fmt;
use core::marker::PhantomData;
use core::time::Duration;

use heapless::{String, Vec};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::Deserialize;

use crate::mac::MacAddress;
use crate::policy::{MacRules, NameString, MAX_MAC_RULES, MAX_NAME_LEN};

/// Maximum security key length in bytes
pub const MAX_KEY_LEN: usize = 64;

/// Hostname of this proxy, carried in every frame
pub type HostString = String<MAX_NAME_LEN>;

/// Pre-shared secret the frame key is derived from
pub type SecretKey = Vec<u8, MAX_KEY_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid MAC address in `{0}`")]
    InvalidMac(&'static str),
    #[error("`{0}` exceeds its maximum length")]
    TooLong(&'static str),
    #[error("`{0}` has too many entries")]
    TooMany(&'static str),
    #[error("rename entry must be `<mac>=<name>` with a non-empty name")]
    InvalidRename,
    #[error("`{0}` contains a JSON escape sequence")]
    Escaped(&'static str),
    #[error("configuration is not valid JSON")]
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub hostname: HostString,
    /// ESP-NOW peer every frame is sent to
    pub broadcast_address: MacAddress,
    pub security_key: SecretKey,
    pub mac_rules: MacRules,
    /// Watchdog restart interval (zero disables)
    pub reboot_interval: Duration,
    /// Heartbeat interval (zero disables)
    pub notify_interval: Duration,
    /// Push the reboot deadline forward on every accepted heartbeat
    pub reset_reboot_on_heartbeat: bool,
    /// Minimum time between relays of the same device (zero disables)
    pub min_relay_interval: Duration,
    /// Drop advertisements from random / resolvable-private addresses
    pub skip_random_addresses: bool,
}

impl ProxyConfig {
    pub fn builder<'a>() -> ProxyConfigBuilder<'a> {
        ProxyConfigBuilder::new()
    }

    /// Load configuration from a JSON document.
    ///
    /// Keys follow the component schema: `hostname`, `broadcast_address`,
    /// `security_key`, `mac_addresses_allowed`, `mac_addresses_blocked`,
    /// `mac_addresses_renamed` (`"<mac>=<name>"` entries),
    /// `auto_reboot_interval` and `notify_interval` (milliseconds), plus
    /// `reset_reboot_on_heartbeat`, `min_relay_interval` (milliseconds) and
    /// `skip_random_addresses`.
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let (raw, _) =
            serde_json_core::from_slice::<RawConfig>(data).map_err(|_| ConfigError::Json)?;

        let mut builder = ProxyConfigBuilder::new();
        builder.hostname = raw.hostname.map(|h| literal(h, "hostname")).transpose()?;
        builder.broadcast_address = raw
            .broadcast_address
            .map(|a| literal(a, "broadcast_address"))
            .transpose()?;
        builder.security_key = raw
            .security_key
            .map(|k| literal(k, "security_key").map(str::as_bytes))
            .transpose()?;

        for &entry in raw.mac_addresses_allowed.entries("mac_addresses_allowed")? {
            builder = builder.allow(parse_mac(entry, "mac_addresses_allowed")?);
        }
        for &entry in raw.mac_addresses_blocked.entries("mac_addresses_blocked")? {
            builder = builder.disallow(parse_mac(entry, "mac_addresses_blocked")?);
        }
        for &entry in raw.mac_addresses_renamed.entries("mac_addresses_renamed")? {
            let entry = literal(entry, "mac_addresses_renamed")?;
            let (mac, name) = entry.split_once('=').ok_or(ConfigError::InvalidRename)?;
            builder = builder.rename(parse_mac(mac, "mac_addresses_renamed")?, name);
        }

        if let Some(ms) = raw.auto_reboot_interval {
            builder = builder.reboot_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = raw.notify_interval {
            builder = builder.notify_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = raw.min_relay_interval {
            builder = builder.min_relay_interval(Duration::from_millis(ms));
        }
        if let Some(reset) = raw.reset_reboot_on_heartbeat {
            builder = builder.reset_reboot_on_heartbeat(reset);
        }
        if let Some(skip) = raw.skip_random_addresses {
            builder = builder.skip_random_addresses(skip);
        }

        builder.build()
    }
}

fn parse_mac(s: &str, field: &'static str) -> Result<MacAddress, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidMac(field))
}

/// Borrowed JSON strings are not unescaped, so any escape is refused rather
/// than kept as literal characters.
fn literal<'a>(s: &'a str, field: &'static str) -> Result<&'a str, ConfigError> {
    if s.contains('\\') {
        return Err(ConfigError::Escaped(field));
    }
    Ok(s)
}

/// Named optional fields with defaults; required fields are checked in
/// [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ProxyConfigBuilder<'a> {
    hostname: Option<&'a str>,
    broadcast_address: Option<&'a str>,
    security_key: Option<&'a [u8]>,
    allowed: Vec<MacAddress, MAX_MAC_RULES>,
    disallowed: Vec<MacAddress, MAX_MAC_RULES>,
    renamed: Vec<(MacAddress, &'a str), MAX_MAC_RULES>,
    overflow: Option<&'static str>,
    reboot_interval: Duration,
    notify_interval: Duration,
    reset_reboot_on_heartbeat: bool,
    min_relay_interval: Duration,
    skip_random_addresses: Option<bool>,
}

impl<'a> ProxyConfigBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hostname(mut self, hostname: &'a str) -> Self {
        self.hostname = Some(hostname);
        self
    }

    pub fn broadcast_address(mut self, address: &'a str) -> Self {
        self.broadcast_address = Some(address);
        self
    }

    pub fn security_key(mut self, key: &'a [u8]) -> Self {
        self.security_key = Some(key);
        self
    }

    pub fn allow(mut self, mac: MacAddress) -> Self {
        if self.allowed.push(mac).is_err() {
            self.overflow.get_or_insert("mac_addresses_allowed");
        }
        self
    }

    pub fn disallow(mut self, mac: MacAddress) -> Self {
        if self.disallowed.push(mac).is_err() {
            self.overflow.get_or_insert("mac_addresses_blocked");
        }
        self
    }

    pub fn rename(mut self, mac: MacAddress, name: &'a str) -> Self {
        if self.renamed.push((mac, name)).is_err() {
            self.overflow.get_or_insert("mac_addresses_renamed");
        }
        self
    }

    pub fn reboot_interval(mut self, interval: Duration) -> Self {
        self.reboot_interval = interval;
        self
    }

    pub fn notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    pub fn reset_reboot_on_heartbeat(mut self, reset: bool) -> Self {
        self.reset_reboot_on_heartbeat = reset;
        self
    }

    pub fn min_relay_interval(mut self, interval: Duration) -> Self {
        self.min_relay_interval = interval;
        self
    }

    pub fn skip_random_addresses(mut self, skip: bool) -> Self {
        self.skip_random_addresses = Some(skip);
        self
    }

    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        if let Some(field) = self.overflow {
            return Err(ConfigError::TooMany(field));
        }

        let hostname = self
            .hostname
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingField("hostname"))?;
        let hostname =
            HostString::try_from(hostname).map_err(|_| ConfigError::TooLong("hostname"))?;

        let broadcast_address = self
            .broadcast_address
            .ok_or(ConfigError::MissingField("broadcast_address"))?;
        let broadcast_address = parse_mac(broadcast_address, "broadcast_address")?;

        let key = self
            .security_key
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingField("security_key"))?;
        let security_key =
            SecretKey::from_slice(key).map_err(|_| ConfigError::TooLong("security_key"))?;

        let mut mac_rules = MacRules::new();
        mac_rules.allowed = self.allowed;
        mac_rules.disallowed = self.disallowed;
        for (mac, name) in self.renamed {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidRename);
            }
            let name = NameString::try_from(name)
                .map_err(|_| ConfigError::TooLong("mac_addresses_renamed"))?;
            // Capacities match, so this cannot overflow
            let _ = mac_rules.renamed.push((mac, name));
        }

        Ok(ProxyConfig {
            hostname,
            broadcast_address,
            security_key,
            mac_rules,
            reboot_interval: self.reboot_interval,
            notify_interval: self.notify_interval,
            reset_reboot_on_heartbeat: self.reset_reboot_on_heartbeat,
            min_relay_interval: self.min_relay_interval,
            skip_random_addresses: self.skip_random_addresses.unwrap_or(true),
        })
    }
}

/// Wire format for the JSON config. Borrowed strings and every key optional, so
/// missing required fields surface as [`ConfigError::MissingField`].
#[derive(Deserialize)]
struct RawConfig<'a> {
    #[serde(borrow, default)]
    hostname: Option<&'a str>,
    #[serde(borrow, default)]
    broadcast_address: Option<&'a str>,
    #[serde(borrow, default)]
    security_key: Option<&'a str>,
    #[serde(borrow, default)]
    mac_addresses_allowed: RawList<'a>,
    #[serde(borrow, default)]
    mac_addresses_blocked: RawList<'a>,
    #[serde(borrow, default)]
    mac_addresses_renamed: RawList<'a>,
    #[serde(default)]
    auto_reboot_interval: Option<u64>,
    #[serde(default)]
    notify_interval: Option<u64>,
    #[serde(default)]
    min_relay_interval: Option<u64>,
    #[serde(default)]
    reset_reboot_on_heartbeat: Option<bool>,
    #[serde(default)]
    skip_random_addresses: Option<bool>,
}

/// String list that remembers overflowing instead of failing the parse, so
/// an oversized list reports [`ConfigError::TooMany`] for its key.
#[derive(Default)]
struct RawList<'a> {
    entries: Vec<&'a str, MAX_MAC_RULES>,
    overflow: bool,
}

impl<'a> RawList<'a> {
    fn entries(&self, field: &'static str) -> Result<&[&'a str], ConfigError> {
        if self.overflow {
            return Err(ConfigError::TooMany(field));
        }
        Ok(&self.entries)
    }
}

impl<'de: 'a, 'a> Deserialize<'de> for RawList<'a> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ListVisitor<'a>(PhantomData<&'a ()>);

        impl<'de: 'a, 'a> Visitor<'de> for ListVisitor<'a> {
            type Value = RawList<'a>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut list = RawList::default();
                while let Some(entry) = seq.next_element::<&'de str>()? {
                    if list.entries.push(entry).is_err() {
                        list.overflow = true;
                    }
                }
                Ok(list)
            }
        }

        deserializer.deserialize_seq(ListVisitor(PhantomData))
    }
}
