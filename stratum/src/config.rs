//! Engine configuration.
//!
//! Options arrive as an opaque string map; subsystems read typed values
//! through [`Properties`]. Unknown keys are kept but never consulted, so a
//! site file may carry settings for outer layers without tripping the core.

use std::collections::HashMap;

/// Recognized option names.
pub mod keys {
    pub const BUFFER_COUNT: &str = "buffercount";
    pub const INDEX_BUFFERS: &str = "indexbuffers";
    pub const MAX_BACKENDS: &str = "maxbackends";
    pub const NO_FSYNC: &str = "nofsync";
    pub const TRANS_CAREFUL: &str = "transcareful";
    pub const MAX_GROUP_TRANS: &str = "maxgrouptrans";
    pub const WAIT_TIME: &str = "waittime";
    pub const GC_SIZE_FACTOR: &str = "gcsizefactor";
    pub const GC_UPDATE_FACTOR: &str = "gcupdatefactor";
    pub const OBJECTID_PREFETCH: &str = "objectid_prefetch";
    pub const TRANSACTION_PREFETCH: &str = "transaction_prefetch";
    pub const VFD_SHARE_MAX: &str = "vfdsharemax";
    pub const VFD_OPTIMIZE: &str = "vfdoptimize";
    pub const VFD_AUTOTUNE: &str = "vfdautotune";
    pub const VFD_ALLOCATION: &str = "vfdallocation";
    pub const VFD_LOGFILE: &str = "vfdlogfile";
    pub const VFD_INDEXLOG: &str = "vfdindexlog";
    pub const BLOB_SEGMENTS: &str = "blobsegments";
    pub const FREE_TUPLES: &str = "freetuples";
    pub const FREE_PAGES: &str = "freepages";
    pub const SWEEPS: &str = "sweeps";
    pub const FRAG_MAXMOVE: &str = "frag_maxmove";
}

/// Typed lookup over the option map.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Integer value, or `default` when absent or unparsable.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Boolean value; accepts t/true/on/1 in any case.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "t" | "true" | "on" | "1" | "yes"
            ),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back_to_defaults() {
        let mut props = Properties::new();
        props.set(keys::SWEEPS, "4");
        props.set(keys::NO_FSYNC, "True");
        props.set(keys::VFD_ALLOCATION, "0.25");
        props.set("garbage", "x");

        assert_eq!(props.get_int(keys::SWEEPS, 1), 4);
        assert_eq!(props.get_int(keys::MAX_BACKENDS, 32), 32);
        assert!(props.get_bool(keys::NO_FSYNC, false));
        assert!(!props.get_bool(keys::VFD_OPTIMIZE, false));
        assert!((props.get_float(keys::VFD_ALLOCATION, 0.5) - 0.25).abs() < f64::EPSILON);
        assert_eq!(props.get_int("garbage", 7), 7);
    }
}
