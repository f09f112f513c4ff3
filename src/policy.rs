/// MAC admission and naming policy for scanned BLE devices.
///
/// Evaluates an observed address against the configured deny-list, allow-list
/// and rename table. Pure over immutable config: no state, no side effects.
use heapless::{String, Vec};

use crate::mac::MacAddress;

/// Maximum number of entries in each MAC list
pub const MAX_MAC_RULES: usize = 32;

/// Maximum length for hostnames and display names
pub const MAX_NAME_LEN: usize = 32;

/// Device display name (renamed label or canonical MAC)
pub type NameString = String<MAX_NAME_LEN>;

/// The three independent MAC rule tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacRules {
    /// Allow-list. Empty means no allow-list is configured.
    pub allowed: Vec<MacAddress, MAX_MAC_RULES>,
    /// Deny-list. Always checked, wins over the allow-list.
    pub disallowed: Vec<MacAddress, MAX_MAC_RULES>,
    /// Display names. Labeling only, never affects admission.
    pub renamed: Vec<(MacAddress, NameString), MAX_MAC_RULES>,
}

impl MacRules {
    pub const fn new() -> Self {
        Self {
            allowed: Vec::new(),
            disallowed: Vec::new(),
            renamed: Vec::new(),
        }
    }
}

/// Why a device was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Address is on the deny-list
    Disallowed,
    /// An allow-list exists and the address is not on it
    NotAllowed,
}

#[derive(Debug, Clone, Copy)]
pub struct MacPolicy<'a> {
    rules: &'a MacRules,
}

impl<'a> MacPolicy<'a> {
    pub const fn new(rules: &'a MacRules) -> Self {
        Self { rules }
    }

    /// Evaluate admission, reporting the reason for a rejection.
    pub fn check(&self, mac: &MacAddress) -> Result<(), Rejection> {
        if self.rules.disallowed.contains(mac) {
            return Err(Rejection::Disallowed);
        }
        if !self.rules.allowed.is_empty() && !self.rules.allowed.contains(mac) {
            return Err(Rejection::NotAllowed);
        }
        Ok(())
    }

    pub fn admit(&self, mac: &MacAddress) -> bool {
        self.check(mac).is_ok()
    }

    /// Renamed label if one is configured, otherwise the canonical MAC string.
    /// When several rename entries match, the last one wins.
    pub fn display_name(&self, mac: &MacAddress) -> NameString {
        let renamed = self
            .rules
            .renamed
            .iter()
            .rev()
            .find(|(m, _)| m == mac)
            .map(|(_, name)| name.clone());

        renamed.unwrap_or_else(|| {
            let mut name = NameString::new();
            let _ = name.push_str(&mac.to_mac_string());
            name
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn name(s: &str) -> NameString {
        NameString::try_from(s).unwrap()
    }

    #[test]
    fn empty_rules_admit_everything() {
        let rules = MacRules::new();
        let policy = MacPolicy::new(&rules);
        assert!(policy.admit(&mac("00:00:00:00:00:00")));
        assert!(policy.admit(&mac("ff:ff:ff:ff:ff:ff")));
    }

    #[test]
    fn disallowed_rejected_without_allow_list() {
        let mut rules = MacRules::new();
        rules.disallowed.push(mac("AA:BB:CC:DD:EE:FF")).unwrap();
        let policy = MacPolicy::new(&rules);
        assert_eq!(
            policy.check(&mac("aa:bb:cc:dd:ee:ff")),
            Err(Rejection::Disallowed)
        );
        assert!(policy.admit(&mac("aa:bb:cc:dd:ee:fe")));
    }

    #[test]
    fn allow_list_restricts() {
        let mut rules = MacRules::new();
        rules.allowed.push(mac("11:22:33:44:55:66")).unwrap();
        let policy = MacPolicy::new(&rules);
        assert!(policy.admit(&mac("11:22:33:44:55:66")));
        assert_eq!(
            policy.check(&mac("77:88:99:AA:BB:CC")),
            Err(Rejection::NotAllowed)
        );
    }

    #[test]
    fn disallow_dominates_allow() {
        let mut rules = MacRules::new();
        let m = mac("11:22:33:44:55:66");
        rules.allowed.push(m).unwrap();
        rules.disallowed.push(m).unwrap();
        let policy = MacPolicy::new(&rules);
        assert_eq!(policy.check(&m), Err(Rejection::Disallowed));
    }

    #[test]
    fn admission_is_independent_of_history() {
        let mut rules = MacRules::new();
        rules.allowed.push(mac("11:22:33:44:55:66")).unwrap();
        rules.disallowed.push(mac("77:88:99:aa:bb:cc")).unwrap();
        let policy = MacPolicy::new(&rules);

        let probes = [
            mac("11:22:33:44:55:66"),
            mac("77:88:99:aa:bb:cc"),
            mac("01:02:03:04:05:06"),
        ];
        let first: heapless::Vec<bool, 3> = probes.iter().map(|m| policy.admit(m)).collect();
        for m in probes.iter().rev() {
            policy.admit(m);
        }
        let second: heapless::Vec<bool, 3> = probes.iter().map(|m| policy.admit(m)).collect();
        assert_eq!(first, second);
        assert_eq!(first.as_slice(), &[true, false, false]);
    }

    #[test]
    fn rename_does_not_affect_admission() {
        let mut rules = MacRules::new();
        let m = mac("11:22:33:44:55:66");
        rules.disallowed.push(m).unwrap();
        rules.renamed.push((m, name("LivingRoom"))).unwrap();
        let policy = MacPolicy::new(&rules);
        assert!(!policy.admit(&m));
        assert_eq!(policy.display_name(&m).as_str(), "LivingRoom");
    }

    #[test]
    fn display_name_defaults_to_canonical_mac() {
        let rules = MacRules::new();
        let policy = MacPolicy::new(&rules);
        assert_eq!(
            policy.display_name(&mac("A4:C1:38:0B:5E:01")).as_str(),
            "a4:c1:38:0b:5e:01"
        );
    }

    #[test]
    fn last_rename_entry_wins() {
        let mut rules = MacRules::new();
        let m = mac("11:22:33:44:55:66");
        rules.renamed.push((m, name("Old"))).unwrap();
        rules.renamed.push((mac("01:01:01:01:01:01"), name("Other"))).unwrap();
        rules.renamed.push((m, name("New"))).unwrap();
        let policy = MacPolicy::new(&rules);
        assert_eq!(policy.display_name(&m).as_str(), "New");
    }
}
