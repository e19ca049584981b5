//! Runtime tunables, loadable from a TOML file.

use serde::Deserialize;

/// Engine-wide tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Lower bound on the completion timeout, seconds.
    pub enqueue_min: u64,
    /// Fixed timeout used when adaptive timing is disabled, seconds.
    pub obd_timeout: u64,
    /// Disables the adaptive timeout estimator.
    pub at_off: bool,
    /// Drop unused cached locks locally before replaying after a
    /// reconnect. Reduces the replay storm on the server.
    pub cancel_unused_locks_before_replay: bool,
    /// Target number of unused locks kept per namespace when the server
    /// does not drive eviction through LRU resize.
    pub max_unused: usize,
    /// Unused locks older than this are always evictable, seconds.
    pub max_age_secs: u64,
    /// Per-lock volume factor for the LRU-resize policy.
    pub lvf: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enqueue_min: 100,
            obd_timeout: 100,
            at_off: false,
            cancel_unused_locks_before_replay: true,
            max_unused: 512,
            max_age_secs: 3600,
            lvf: 1,
        }
    }
}

impl Settings {
    /// Parses settings from TOML text. Unset fields keep their defaults.
    pub fn from_toml(text: &str) -> Result<Settings, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let s = Settings::from_toml("enqueue_min = 5\nat_off = true\n").unwrap();
        assert_eq!(s.enqueue_min, 5);
        assert!(s.at_off);
        assert_eq!(s.obd_timeout, Settings::default().obd_timeout);
        assert!(s.cancel_unused_locks_before_replay);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Settings::from_toml("no_such_knob = 1\n").is_err());
    }
}
