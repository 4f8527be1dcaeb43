//! Configuration for the mutation layer.
//!
//! [`UpdateConfig`] gathers everything the update paths need to know about an
//! index: which fields are updatable in place, how sealed-segment patches are
//! stored, how dynamic trees are sized and how segment merges run.
//!
//! # Example
//!
//! ```
//! use segpatch::lexical::config::{PatchCompression, UpdateConfig};
//!
//! let config = UpdateConfig::from_json_str(
//!     r#"{
//!         "fields": [
//!             { "name": "tag", "updatable": false, "shard_count": 4 },
//!             { "name": "status", "updatable": true }
//!         ],
//!         "patch": { "compression": { "type": "lz4", "block_size": 4096 } }
//!     }"#,
//! )
//! .unwrap();
//!
//! assert!(config.field("status").unwrap().updatable);
//! assert_eq!(config.patch.compression, PatchCompression::Lz4 { block_size: 4096 });
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegpatchError};
use crate::storage::compression::DEFAULT_BLOCK_SIZE;

/// Smallest allowed node capacity of a dynamic tree.
pub const MIN_NODE_CAPACITY: usize = 4;

/// Default node capacity of a dynamic tree.
pub const DEFAULT_NODE_CAPACITY: usize = 64;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Fields that accept updates.
    pub fields: Vec<FieldUpdateConfig>,

    /// Patch file settings.
    pub patch: PatchConfig,

    /// Dynamic tree settings.
    pub dynamic: DynamicTreeConfig,

    /// Segment merge settings.
    pub merge: MergeConfig,
}

impl UpdateConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: UpdateConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            SegpatchError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Look up the configuration of a field.
    pub fn field(&self, name: &str) -> Option<&FieldUpdateConfig> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Add a field, replacing any previous configuration with the same name.
    pub fn with_field(mut self, field: FieldUpdateConfig) -> Self {
        self.fields.retain(|existing| existing.name != field.name);
        self.fields.push(field);
        self
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        for (i, field) in self.fields.iter().enumerate() {
            field.validate()?;
            if self.fields[..i].iter().any(|other| other.name == field.name) {
                return Err(SegpatchError::config(format!(
                    "field {:?} is configured twice",
                    field.name
                )));
            }
        }
        self.patch.validate()?;
        self.dynamic.validate()?;
        self.merge.validate()
    }
}

/// Per-field update settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdateConfig {
    /// Field name.
    pub name: String,

    /// Keep postings in dynamic trees instead of patching sealed segments.
    #[serde(default)]
    pub updatable: bool,

    /// Number of dictionary shards. Values above 1 shard the update buffers too.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
}

fn default_shard_count() -> u32 {
    1
}

impl FieldUpdateConfig {
    /// A patched, unsharded field.
    pub fn patched(name: impl Into<String>) -> Self {
        FieldUpdateConfig {
            name: name.into(),
            updatable: false,
            shard_count: 1,
        }
    }

    /// A field kept in dynamic trees.
    pub fn updatable(name: impl Into<String>) -> Self {
        FieldUpdateConfig {
            name: name.into(),
            updatable: true,
            shard_count: 1,
        }
    }

    /// Set the shard count.
    pub fn with_shards(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Whether update buffers for this field are sharded.
    pub fn is_sharded(&self) -> bool {
        self.shard_count > 1
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SegpatchError::config("field name must not be empty"));
        }
        if self.name.contains('/') || self.name.contains("_@_") {
            return Err(SegpatchError::config(format!(
                "field name {:?} must not contain '/' or '_@_'",
                self.name
            )));
        }
        if self.shard_count == 0 {
            return Err(SegpatchError::config(format!(
                "field {:?}: shard_count must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Patch file settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Block compression applied to every patch file.
    pub compression: PatchCompression,
}

impl PatchConfig {
    fn validate(&self) -> Result<()> {
        if let PatchCompression::Lz4 { block_size } = self.compression
            && block_size == 0
        {
            return Err(SegpatchError::config("lz4 block_size must be positive"));
        }
        Ok(())
    }
}

/// Transparent compression of patch files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatchCompression {
    /// Raw patch records.
    #[default]
    None,
    /// lz4 blocks of `block_size` uncompressed bytes.
    Lz4 {
        #[serde(default = "default_block_size")]
        block_size: usize,
    },
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

/// Dynamic tree settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicTreeConfig {
    /// Maximum entries per node. Must be a power of two.
    pub node_capacity: usize,

    /// Upper bound on live node memory per segment arena.
    pub memory_quota_bytes: Option<u64>,
}

impl Default for DynamicTreeConfig {
    fn default() -> Self {
        DynamicTreeConfig {
            node_capacity: DEFAULT_NODE_CAPACITY,
            memory_quota_bytes: None,
        }
    }
}

impl DynamicTreeConfig {
    fn validate(&self) -> Result<()> {
        if self.node_capacity < MIN_NODE_CAPACITY || !self.node_capacity.is_power_of_two() {
            return Err(SegpatchError::config(format!(
                "node_capacity must be a power of two >= {MIN_NODE_CAPACITY}, got {}",
                self.node_capacity
            )));
        }
        if self.memory_quota_bytes == Some(0) {
            return Err(SegpatchError::config("memory_quota_bytes must be positive"));
        }
        Ok(())
    }
}

/// Segment merge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Document frequency at which a merged term also gets a bitmap posting.
    /// 0 disables high-frequency postings.
    pub high_frequency_threshold: usize,

    /// Number of destination segments merged concurrently.
    pub parallelism: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            high_frequency_threshold: 0,
            parallelism: num_cpus::get(),
        }
    }
}

impl MergeConfig {
    fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(SegpatchError::config("parallelism must be at least 1"));
        }
        Ok(())
    }
}
