/// BLE advertisement sink.
///
/// Every scanned advertisement passes through [`AdvertisementListener::on_advertisement`]:
/// decode → admit → (throttle) → build reading → encode → send. Any miss is a
/// silent drop counted in [`ListenerStats`]; nothing on this path returns an
/// error or panics, so one malformed advertisement cannot destabilize the
/// scan callback.
use core::time::Duration;

use heapless::Vec;

use crate::comm::{Radio, RelayError, Uplink};
use crate::config::ProxyConfig;
use crate::mac::MacAddress;
use crate::policy::{MacPolicy, Rejection};
use crate::protocol::{Record, SensorReading};
use crate::scanner::{AddressKind, Advertisement, SensorDecoder};

/// Devices tracked for relay throttling
pub const MAX_TRACKED_DEVICES: usize = 32;

/// Result of handling one advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Frame handed to the radio with this sequence number
    Relayed(u32),
    /// Scanning is disabled
    Disabled,
    /// Random / resolvable-private advertiser address
    RandomAddress,
    /// Decoder did not recognize the payload
    Undecoded,
    Rejected(Rejection),
    /// Device was relayed less than `min_relay_interval` ago
    Throttled,
    /// Admitted but the frame could not be sent
    Dropped(RelayError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub seen: u32,
    pub relayed: u32,
    pub skipped_random: u32,
    pub undecoded: u32,
    pub rejected: u32,
    pub throttled: u32,
    pub dropped: u32,
}

pub struct AdvertisementListener<'c, D> {
    policy: MacPolicy<'c>,
    decoder: D,
    hostname: &'c str,
    min_relay_interval: Duration,
    skip_random_addresses: bool,
    last_relayed: Vec<(MacAddress, Duration), MAX_TRACKED_DEVICES>,
    enabled: bool,
    stats: ListenerStats,
}

impl<'c, D: SensorDecoder> AdvertisementListener<'c, D> {
    pub fn new(config: &'c ProxyConfig, decoder: D) -> Self {
        Self {
            policy: MacPolicy::new(&config.mac_rules),
            decoder,
            hostname: config.hostname.as_str(),
            min_relay_interval: config.min_relay_interval,
            skip_random_addresses: config.skip_random_addresses,
            last_relayed: Vec::new(),
            enabled: true,
            stats: ListenerStats::default(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            log::info!("BLE relay {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Handle one advertisement at uptime `now`.
    pub fn on_advertisement<R: Radio>(
        &mut self,
        adv: &Advertisement,
        now: Duration,
        uplink: &mut Uplink<R>,
    ) -> Outcome {
        let outcome = self.process(adv, now, uplink);
        self.count(outcome);
        outcome
    }

    fn process<R: Radio>(
        &mut self,
        adv: &Advertisement,
        now: Duration,
        uplink: &mut Uplink<R>,
    ) -> Outcome {
        if !self.enabled {
            return Outcome::Disabled;
        }

        if self.skip_random_addresses && adv.address_kind == AddressKind::Random {
            return Outcome::RandomAddress;
        }

        let Some(measurement) = self.decoder.decode(adv) else {
            return Outcome::Undecoded;
        };

        if let Err(rejection) = self.policy.check(&adv.mac) {
            log::debug!("Device {} not relayed: {:?}", adv.mac, rejection);
            return Outcome::Rejected(rejection);
        }

        if self.is_throttled(&adv.mac, now) {
            return Outcome::Throttled;
        }

        let reading = SensorReading {
            mac: adv.mac,
            name: self.policy.display_name(&adv.mac),
            measurement,
        };

        match uplink.send(self.hostname, &Record::Sensor(reading)) {
            Ok(sequence) => {
                self.mark_relayed(adv.mac, now);
                log::debug!("Relayed {} as frame {}", adv.mac, sequence);
                Outcome::Relayed(sequence)
            }
            Err(e) => {
                log::debug!("Dropped frame for {}: {:?}", adv.mac, e);
                Outcome::Dropped(e)
            }
        }
    }

    fn count(&mut self, outcome: Outcome) {
        let s = &mut self.stats;
        s.seen = s.seen.saturating_add(1);
        let counter = match outcome {
            Outcome::Relayed(_) => &mut s.relayed,
            Outcome::Disabled => return,
            Outcome::RandomAddress => &mut s.skipped_random,
            Outcome::Undecoded => &mut s.undecoded,
            Outcome::Rejected(_) => &mut s.rejected,
            Outcome::Throttled => &mut s.throttled,
            Outcome::Dropped(_) => &mut s.dropped,
        };
        *counter = counter.saturating_add(1);
    }

    fn is_throttled(&self, mac: &MacAddress, now: Duration) -> bool {
        if self.min_relay_interval.is_zero() {
            return false;
        }
        self.last_relayed
            .iter()
            .find(|(m, _)| m == mac)
            .is_some_and(|(_, last)| now.saturating_sub(*last) < self.min_relay_interval)
    }

    fn mark_relayed(&mut self, mac: MacAddress, now: Duration) {
        if self.min_relay_interval.is_zero() {
            return;
        }
        if let Some(entry) = self.last_relayed.iter_mut().find(|(m, _)| *m == mac) {
            entry.1 = now;
            return;
        }
        if self.last_relayed.is_full() {
            if let Some(oldest) = self
                .last_relayed
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(i, _)| i)
            {
                self.last_relayed.swap_remove(oldest);
            }
        }
        let _ = self.last_relayed.push((mac, now));
    }
}
