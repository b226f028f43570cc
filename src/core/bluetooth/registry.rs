//! Discovered-device registry
//! Tracks every tracker the scanner has admitted and whether it has been seen
//! recently. Only the scanner writes; everyone else reads cloned snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{Configuration, ConfigError, compile_name_pattern, normalise_address};
use crate::core::bluetooth::transport::Advertisement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    NotSeen,
    RecentlySeen,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::NotSeen => write!(f, "NOT SEEN"),
            Liveness::RecentlySeen => write!(f, "RECENTLY SEEN"),
        }
    }
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenDevice {
    pub address: String,
    pub alias: Option<String>,
    pub name: Option<String>,
    pub liveness: Liveness,
    pub last_seen: Instant,
    pub rssi: Option<i16>,
}

impl SeenDevice {
    /// Alias, else advertised name, else address.
    pub fn display_id(&self) -> &str {
        self.alias
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.address)
    }
}

/// Result of folding one discovery tick into the registry.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickChanges {
    pub discovered: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, SeenDevice>>,
    name_patterns: Vec<Regex>,
    aliases: HashMap<String, String>,
    seen_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(config: &Configuration) -> Result<Self, ConfigError> {
        let name_patterns = config
            .name_patterns
            .iter()
            .map(|p| compile_name_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            devices: RwLock::new(HashMap::new()),
            name_patterns,
            aliases: config
                .device_aliases
                .iter()
                .map(|(adr, alias)| (adr.clone(), alias.clone()))
                .collect(),
            seen_timeout: config.seen_timeout(),
        })
    }

    fn name_matches(&self, name: Option<&str>) -> bool {
        name.is_some_and(|name| self.name_patterns.iter().any(|re| re.is_match(name)))
    }

    /// Folds one tick of sightings into the registry, then re-evaluates liveness of
    /// every known device.
    pub fn apply_tick(&self, sightings: &[Advertisement], now: Instant) -> TickChanges {
        let mut changes = TickChanges::default();
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);

        for sighting in sightings {
            let address = normalise_address(&sighting.address);
            if let Some(dev) = devices.get_mut(&address) {
                dev.last_seen = now;
                if sighting.name.is_some() {
                    dev.name = sighting.name.clone();
                }
                dev.rssi = sighting.rssi;
                dev.liveness = Liveness::RecentlySeen;
            } else if self.name_matches(sighting.name.as_deref()) {
                devices.insert(
                    address.clone(),
                    SeenDevice {
                        alias: self.aliases.get(&address).cloned(),
                        address: address.clone(),
                        name: sighting.name.clone(),
                        liveness: Liveness::RecentlySeen,
                        last_seen: now,
                        rssi: sighting.rssi,
                    },
                );
                changes.discovered.push(address);
            }
        }

        for dev in devices.values_mut() {
            if dev.liveness == Liveness::RecentlySeen
                && now.saturating_duration_since(dev.last_seen) > self.seen_timeout
            {
                dev.liveness = Liveness::NotSeen;
                changes.expired.push(dev.address.clone());
            }
        }

        changes
    }

    pub fn get(&self, address: &str) -> Option<SeenDevice> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    pub fn liveness(&self, address: &str) -> Option<Liveness> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|d| d.liveness)
    }

    pub fn snapshot(&self) -> Vec<SeenDevice> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Recently seen devices ordered by display id (ties broken by address).
    pub fn recently_seen(&self) -> Vec<SeenDevice> {
        let mut seen: Vec<SeenDevice> = self
            .snapshot()
            .into_iter()
            .filter(|d| d.liveness == Liveness::RecentlySeen)
            .collect();
        seen.sort_by(|a, b| {
            a.display_id()
                .cmp(b.display_id())
                .then_with(|| a.address.cmp(&b.address))
        });
        seen
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        let mut config = Configuration::default();
        config.device_aliases = [("AA:AA:AA:AA:AA:01".to_string(), "Zulu".to_string())].into();
        config.seen_timeout_secs = 5.0;
        DeviceRegistry::new(&config.validated().unwrap()).unwrap()
    }

    fn ad(address: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        }
    }

    #[test]
    fn only_matching_names_are_admitted() {
        let registry = registry();
        let now = Instant::now();
        let changes = registry.apply_tick(
            &[
                ad("aa:aa:aa:aa:aa:01", Some("SmartVNS")),
                ad("BB:BB:BB:BB:BB:02", Some("Headphones")),
                ad("CC:CC:CC:CC:CC:03", None),
            ],
            now,
        );
        assert_eq!(changes.discovered, vec!["AA:AA:AA:AA:AA:01".to_string()]);
        let dev = registry.get("AA:AA:AA:AA:AA:01").unwrap();
        assert_eq!(dev.alias.as_deref(), Some("Zulu"));
        assert_eq!(dev.display_id(), "Zulu");
        assert_eq!(dev.liveness, Liveness::RecentlySeen);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resighting_updates_signal_and_keeps_name() {
        let registry = registry();
        let t0 = Instant::now();
        registry.apply_tick(&[ad("DD:DD:DD:DD:DD:04", Some("SmartVNS"))], t0);

        let mut again = ad("DD:DD:DD:DD:DD:04", None);
        again.rssi = Some(-40);
        let t1 = t0 + Duration::from_secs(1);
        registry.apply_tick(&[again], t1);

        let dev = registry.get("DD:DD:DD:DD:DD:04").unwrap();
        assert_eq!(dev.name.as_deref(), Some("SmartVNS"));
        assert_eq!(dev.rssi, Some(-40));
        assert_eq!(dev.last_seen, t1);
    }

    #[test]
    fn liveness_decays_after_seen_timeout_and_recovers() {
        let registry = registry();
        let t0 = Instant::now();
        registry.apply_tick(&[ad("DD:DD:DD:DD:DD:04", Some("SmartVNS"))], t0);

        let changes = registry.apply_tick(&[], t0 + Duration::from_secs(5));
        assert!(changes.expired.is_empty());
        assert_eq!(registry.liveness("DD:DD:DD:DD:DD:04"), Some(Liveness::RecentlySeen));

        let changes = registry.apply_tick(&[], t0 + Duration::from_millis(5001));
        assert_eq!(changes.expired, vec!["DD:DD:DD:DD:DD:04".to_string()]);
        assert_eq!(registry.liveness("DD:DD:DD:DD:DD:04"), Some(Liveness::NotSeen));
        assert!(registry.recently_seen().is_empty());

        registry.apply_tick(
            &[ad("DD:DD:DD:DD:DD:04", Some("SmartVNS"))],
            t0 + Duration::from_secs(8),
        );
        assert_eq!(registry.liveness("DD:DD:DD:DD:DD:04"), Some(Liveness::RecentlySeen));
    }

    #[test]
    fn recently_seen_is_sorted_by_display_id() {
        let registry = registry();
        let now = Instant::now();
        registry.apply_tick(
            &[
                ad("AA:AA:AA:AA:AA:01", Some("SmartVNS")),
                ad("33:33:33:33:33:33", Some("SmartVNS")),
                ad("11:11:11:11:11:11", Some("SmartVNS")),
            ],
            now,
        );
        let ids: Vec<String> = registry
            .recently_seen()
            .iter()
            .map(|d| format!("{}({})", d.display_id(), d.address))
            .collect();
        assert_eq!(
            ids,
            vec![
                "SmartVNS(11:11:11:11:11:11)",
                "SmartVNS(33:33:33:33:33:33)",
                "Zulu(AA:AA:AA:AA:AA:01)",
            ]
        );
    }
}
