//! Layered configuration: compiled-in defaults, optionally overridden
//! by a TOML file, optionally overridden again by explicit builder
//! calls — the same three-stage layering the teacher applies to its
//! own on-disk index configs (defaults, then a merged `toml::Value`,
//! then builder calls).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    Example,
    Cceh,
    FastFair,
    Clht,
    RHTree,
    Wort,
}

impl Default for IndexType {
    fn default() -> Self {
        IndexType::Cceh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeType {
    Single,
    Hybrid,
}

impl Default for SchemeType {
    fn default() -> Self {
        SchemeType::Single
    }
}

/// Tunables specific to each index backend. Unused fields for the
/// currently selected `index_type` are harmless; they mirror the
/// original's single flat `Options` object (`original_source`'s
/// `options.hpp`) rather than per-index sub-structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pmem_file_path: PathBuf,
    pub pmem_file_size: usize,
    pub index_type: IndexType,
    pub scheme_type: SchemeType,

    /// CCEH: initial directory depth (2^depth segments at startup).
    pub cceh_initial_depth: usize,
    /// CCEH: slots per segment.
    pub cceh_segment_slots: usize,

    /// FAST-FAIR: page size in bytes (fixed at 512 per the original;
    /// exposed for tests that want smaller pages to force splits sooner).
    pub fastfair_page_size: usize,

    /// CLHT: initial bucket count (rounded up to a power of two).
    pub clht_initial_buckets: usize,
    /// CLHT: load factor (percent full) that triggers a grow.
    pub clht_perc_full_double: usize,

    /// RHTree: buckets per leaf.
    pub rhtree_leaf_buckets: usize,
    /// RHTree: slots per bucket.
    pub rhtree_bucket_slots: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pmem_file_path: PathBuf::from("/tmp/pie-engine.pm"),
            pmem_file_size: 2 << 30,
            index_type: IndexType::default(),
            scheme_type: SchemeType::default(),
            cceh_initial_depth: 10,
            cceh_segment_slots: 1024,
            fastfair_page_size: 512,
            clht_initial_buckets: 1024,
            clht_perc_full_double: 50,
            rhtree_leaf_buckets: 32,
            rhtree_bucket_slots: 8,
        }
    }
}

impl Config {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let partial: PartialConfig =
            toml::from_str(&text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(partial.merge_over(Config::default()))
    }

    pub fn with_index_type(mut self, t: IndexType) -> Self {
        self.index_type = t;
        self
    }

    pub fn with_pmem_file_size(mut self, size: usize) -> Self {
        self.pmem_file_size = size;
        self
    }

    pub fn with_pmem_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pmem_file_path = path.into();
        self
    }

    pub fn with_cceh_initial_depth(mut self, depth: usize) -> Self {
        self.cceh_initial_depth = depth;
        self
    }

    pub fn with_cceh_segment_slots(mut self, slots: usize) -> Self {
        self.cceh_segment_slots = slots;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pmem_file_size == 0 {
            return Err(Error::InvalidConfig("pmem_file_size must be > 0".into()));
        }
        if self.cceh_segment_slots == 0 || !self.cceh_segment_slots.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "cceh_segment_slots must be a power of two".into(),
            ));
        }
        if !self.clht_initial_buckets.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "clht_initial_buckets must be a power of two".into(),
            ));
        }
        Ok(())
    }
}

/// Mirrors `Config` but with every field optional, so a TOML file only
/// needs to mention the keys it wants to override.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct PartialConfig {
    pmem_file_path: Option<PathBuf>,
    pmem_file_size: Option<usize>,
    index_type: Option<IndexType>,
    scheme_type: Option<SchemeType>,
    cceh_initial_depth: Option<usize>,
    cceh_segment_slots: Option<usize>,
    fastfair_page_size: Option<usize>,
    clht_initial_buckets: Option<usize>,
    clht_perc_full_double: Option<usize>,
    rhtree_leaf_buckets: Option<usize>,
    rhtree_bucket_slots: Option<usize>,
}

impl Default for PartialConfig {
    fn default() -> Self {
        PartialConfig {
            pmem_file_path: None,
            pmem_file_size: None,
            index_type: None,
            scheme_type: None,
            cceh_initial_depth: None,
            cceh_segment_slots: None,
            fastfair_page_size: None,
            clht_initial_buckets: None,
            clht_perc_full_double: None,
            rhtree_leaf_buckets: None,
            rhtree_bucket_slots: None,
        }
    }
}

impl PartialConfig {
    fn merge_over(self, mut base: Config) -> Config {
        macro_rules! over {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    base.$field = v;
                }
            };
        }
        over!(pmem_file_path);
        over!(pmem_file_size);
        over!(index_type);
        over!(scheme_type);
        over!(cceh_initial_depth);
        over!(cceh_segment_slots);
        over!(fastfair_page_size);
        over!(clht_initial_buckets);
        over!(clht_perc_full_double);
        over!(rhtree_leaf_buckets);
        over!(rhtree_bucket_slots);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = Config::default()
            .with_index_type(IndexType::RHTree)
            .with_cceh_initial_depth(1)
            .with_cceh_segment_slots(32);
        assert_eq!(cfg.index_type, IndexType::RHTree);
        assert_eq!(cfg.cceh_initial_depth, 1);
        assert_eq!(cfg.cceh_segment_slots, 32);
    }

    #[test]
    fn toml_file_overrides_only_named_keys() {
        let dir = std::env::temp_dir().join(format!("pie-config-test-{}.toml", std::process::id()));
        std::fs::write(&dir, "index_type = \"CCEH\"\ncceh_initial_depth = 1\n").unwrap();
        let cfg = Config::from_toml_file(&dir).unwrap();
        assert_eq!(cfg.index_type, IndexType::Cceh);
        assert_eq!(cfg.cceh_initial_depth, 1);
        // untouched key keeps its default
        assert_eq!(cfg.cceh_segment_slots, Config::default().cceh_segment_slots);
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn rejects_non_power_of_two_segment_slots() {
        let cfg = Config::default();
        let cfg = Config {
            cceh_segment_slots: 100,
            ..cfg
        };
        assert!(cfg.validate().is_err());
    }
}
