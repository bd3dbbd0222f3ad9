//! Layout contracts: where every field of the foreign circuit scene lives.
//!
//! All offsets are in bytes. Table offsets are relative to the scene root,
//! bucket and node offsets are relative to the bucket or node, and record
//! offsets are relative to the node value.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coord::Coordinate;

/// Preset matching the scene graph of BDS 1.18.2 built with MSVC.
pub const PRESET_BDS_1_18_2: &str = "bds-1.18.2-msvc";
/// Preset used by the in-memory simulation.
pub const PRESET_SIMULATED: &str = "simulated";

const POINTER_SIZE: u64 = 8;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid layout contract {contract}: {reason}")]
    Invalid { contract: String, reason: String },
}

/// Who unlinks pending-update nodes once the pass has consumed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// The host clears its pending map after the intercepted routine returns.
    Host,
    /// The pass unlinks and releases every queue node itself.
    Pass,
}

/// Open-chained hash table with a sentinel-terminated doubly linked node list.
///
/// Table header (MSVC `unordered_map`):
/// ```text
/// offset  field            size
/// ------  ---------------  ----
/// 0x08    sentinel node    8
/// 0x10    element count    8
/// 0x18    bucket array     8
/// 0x20    bucket array end 8
/// 0x30    bucket mask      8
/// ```
/// Each bucket is a `[head, tail]` pointer pair; an empty bucket has both
/// pointing at the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTableLayout {
    pub table_offset: u64,
    pub sentinel_offset: u64,
    pub len_offset: u64,
    pub buckets_offset: u64,
    pub buckets_end_offset: u64,
    pub mask_offset: u64,
    pub bucket_stride: u64,
    pub bucket_head_offset: u64,
    pub bucket_tail_offset: u64,
    pub node_next_offset: u64,
    pub node_prev_offset: u64,
    pub node_key_offset: u64,
    pub node_value_offset: u64,
    pub node_size: u64,
}

impl HashTableLayout {
    /// MSVC `unordered_map<BlockPos, V>` placed at `table_offset` in the scene.
    pub fn msvc(table_offset: u64, node_size: u64) -> Self {
        Self {
            table_offset,
            sentinel_offset: 0x08,
            len_offset: 0x10,
            buckets_offset: 0x18,
            buckets_end_offset: 0x20,
            mask_offset: 0x30,
            bucket_stride: 0x10,
            bucket_head_offset: 0x00,
            bucket_tail_offset: 0x08,
            node_next_offset: 0x00,
            node_prev_offset: 0x08,
            node_key_offset: 0x10,
            node_value_offset: 0x20,
            node_size,
        }
    }

    /// Bytes of the table header that must be readable from `table_offset`.
    pub fn header_extent(&self) -> u64 {
        [
            self.sentinel_offset,
            self.len_offset,
            self.buckets_offset,
            self.buckets_end_offset,
            self.mask_offset,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + POINTER_SIZE
    }

    fn validate(&self, contract: &str, table: &str) -> Result<(), ContractError> {
        let fail = |reason: String| ContractError::Invalid {
            contract: contract.to_string(),
            reason: format!("{table}: {reason}"),
        };
        if self.bucket_stride < 2 * POINTER_SIZE {
            return Err(fail(format!(
                "bucket_stride {} cannot hold a head/tail pair",
                self.bucket_stride
            )));
        }
        if self.bucket_head_offset == self.bucket_tail_offset {
            return Err(fail("bucket head and tail share an offset".into()));
        }
        if self.bucket_head_offset.max(self.bucket_tail_offset) + POINTER_SIZE > self.bucket_stride
        {
            return Err(fail("bucket pointers exceed bucket_stride".into()));
        }
        if self.node_next_offset == self.node_prev_offset {
            return Err(fail("node next and prev share an offset".into()));
        }
        let key_end = self.node_key_offset + Coordinate::SIZE as u64;
        if key_end > self.node_size || self.node_value_offset >= self.node_size {
            return Err(fail(format!(
                "key/value offsets exceed node_size {:#x}",
                self.node_size
            )));
        }
        if self.node_value_offset < key_end && self.node_value_offset >= self.node_key_offset {
            return Err(fail("node value overlaps the key".into()));
        }
        Ok(())
    }
}

/// Contiguous run of fixed-size entries (`begin`/`end`/`capacity` triple).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub start_offset: u64,
    pub finish_offset: u64,
    pub storage_end_offset: u64,
    pub entry_stride: u64,
    pub entry_position_offset: u64,
    /// Sanity bound on entries per record; larger runs are treated as corrupt.
    pub max_len: u64,
}

impl RecordLayout {
    pub fn msvc_vector(entry_stride: u64, entry_position_offset: u64) -> Self {
        Self {
            start_offset: 0x00,
            finish_offset: 0x08,
            storage_end_offset: 0x10,
            entry_stride,
            entry_position_offset,
            max_len: 1 << 16,
        }
    }

    fn validate(&self, contract: &str) -> Result<(), ContractError> {
        let fail = |reason: &str| ContractError::Invalid {
            contract: contract.to_string(),
            reason: format!("record: {reason}"),
        };
        if self.entry_stride == 0 {
            return Err(fail("entry_stride is zero"));
        }
        if self.entry_position_offset + Coordinate::SIZE as u64 > self.entry_stride {
            return Err(fail("entry position does not fit in entry_stride"));
        }
        let mut fields = [
            self.start_offset,
            self.finish_offset,
            self.storage_end_offset,
        ];
        fields.sort_unstable();
        if fields.windows(2).any(|w| w[1] - w[0] < POINTER_SIZE) {
            return Err(fail("record pointer fields overlap"));
        }
        if self.max_len == 0 {
            return Err(fail("max_len is zero"));
        }
        Ok(())
    }
}

/// Intrusive circular list of pending updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLayout {
    /// Field in the scene root holding the address of the sentinel node.
    pub sentinel_pointer_offset: u64,
    /// Element counter in the scene root, if the host keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len_offset: Option<u64>,
    pub node_next_offset: u64,
    pub node_prev_offset: u64,
    pub node_position_offset: u64,
    pub node_originator_offset: u64,
    pub node_size: u64,
    pub drain: DrainPolicy,
}

impl QueueLayout {
    fn validate(&self, contract: &str) -> Result<(), ContractError> {
        let fail = |reason: &str| ContractError::Invalid {
            contract: contract.to_string(),
            reason: format!("pending: {reason}"),
        };
        if self.node_next_offset == self.node_prev_offset {
            return Err(fail("node next and prev share an offset"));
        }
        if self.node_position_offset + Coordinate::SIZE as u64 > self.node_size
            || self.node_originator_offset + POINTER_SIZE > self.node_size
        {
            return Err(fail("node fields exceed node_size"));
        }
        Ok(())
    }
}

/// Virtual dispatch on a host component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLayout {
    /// Offset of the vtable pointer inside the component object.
    pub vtable_offset: u64,
    /// Index of `removeSource` in the component vtable.
    pub remove_source_slot: u64,
}

impl ComponentLayout {
    /// Upper bound on vtable slots accepted from a contract file.
    pub const MAX_SLOT: u64 = 512;

    /// Byte offset of the `removeSource` slot inside the vtable.
    pub fn remove_source_offset(&self) -> u64 {
        self.remove_source_slot * POINTER_SIZE
    }

    fn validate(&self, contract: &str) -> Result<(), ContractError> {
        let fail = |reason: &str| ContractError::Invalid {
            contract: contract.to_string(),
            reason: format!("component: {reason}"),
        };
        if self.vtable_offset % POINTER_SIZE != 0 {
            return Err(fail("vtable pointer is not pointer aligned"));
        }
        if self.remove_source_slot >= Self::MAX_SLOT {
            return Err(fail("remove_source_slot out of range"));
        }
        Ok(())
    }
}

/// Named, versioned description of the scene root and the structures it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutContract {
    pub name: String,
    pub version: String,
    /// Upper bound on nodes walked in one chain before it counts as corrupt.
    pub max_chain_walk: u64,
    /// Offset of the owned component pointer inside a registry node value.
    pub component_pointer_offset: u64,
    pub registry: HashTableLayout,
    pub association: HashTableLayout,
    pub record: RecordLayout,
    pub pending: QueueLayout,
    pub component: ComponentLayout,
}

impl LayoutContract {
    /// Scene graph of BDS 1.18.2 (MSVC build).
    ///
    /// ```text
    /// 0x000  mAllComponents        unordered_map<BlockPos, unique_ptr<Component>>
    /// 0x098  mPowerAssociationMap  unordered_map<BlockPos, CircuitComponentList>
    /// 0x118  mPendingUpdates       unordered_map<BlockPos, PendingEntry>
    ///          +0x08 list sentinel, +0x10 element count
    /// ```
    pub fn bds_1_18_2() -> Self {
        Self {
            name: PRESET_BDS_1_18_2.to_string(),
            version: "1.18.2".to_string(),
            max_chain_walk: 1 << 20,
            component_pointer_offset: 0x00,
            registry: HashTableLayout::msvc(0x00, 0x28),
            association: HashTableLayout::msvc(0x98, 0x38),
            record: RecordLayout::msvc_vector(32, 12),
            pending: QueueLayout {
                sentinel_pointer_offset: 0x120,
                len_offset: Some(0x128),
                node_next_offset: 0x00,
                node_prev_offset: 0x08,
                node_position_offset: 0x10,
                node_originator_offset: 0x20,
                node_size: 0x40,
                drain: DrainPolicy::Host,
            },
            // vptr first; slot 11 follows the accessors and type queries of
            // BaseCircuitComponent.
            component: ComponentLayout {
                vtable_offset: 0x00,
                remove_source_slot: 11,
            },
        }
    }

    /// Same table shapes as the BDS preset; the pass owns queue draining.
    pub fn simulated() -> Self {
        let mut contract = Self::bds_1_18_2();
        contract.name = PRESET_SIMULATED.to_string();
        contract.version = "sim-1".to_string();
        contract.max_chain_walk = 4096;
        contract.pending.drain = DrainPolicy::Pass;
        contract
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            PRESET_BDS_1_18_2 => Some(Self::bds_1_18_2()),
            PRESET_SIMULATED => Some(Self::simulated()),
            _ => None,
        }
    }

    pub fn preset_names() -> &'static [&'static str] {
        &[PRESET_BDS_1_18_2, PRESET_SIMULATED]
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ContractError> {
        let contract: LayoutContract = toml::from_str(contents)?;
        contract.validate()?;
        Ok(contract)
    }

    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml(&self) -> Result<String, ContractError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject contracts whose offsets cannot describe a consistent layout.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.max_chain_walk == 0 {
            return Err(ContractError::Invalid {
                contract: self.name.clone(),
                reason: "max_chain_walk is zero".into(),
            });
        }
        self.registry.validate(&self.name, "registry")?;
        self.association.validate(&self.name, "association")?;
        self.record.validate(&self.name)?;
        self.pending.validate(&self.name)?;
        self.component.validate(&self.name)?;

        let value_room = self.association.node_size - self.association.node_value_offset;
        let record_end = [
            self.record.start_offset,
            self.record.finish_offset,
            self.record.storage_end_offset,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + POINTER_SIZE;
        if record_end > value_room {
            return Err(ContractError::Invalid {
                contract: self.name.clone(),
                reason: "record pointers exceed the association node".into(),
            });
        }
        if self.component_pointer_offset + POINTER_SIZE
            > self.registry.node_size - self.registry.node_value_offset
        {
            return Err(ContractError::Invalid {
                contract: self.name.clone(),
                reason: "component pointer exceeds the registry node".into(),
            });
        }
        Ok(())
    }

    /// Bytes of the scene root the contract reads from.
    pub fn root_extent(&self) -> u64 {
        let tables = [&self.registry, &self.association]
            .into_iter()
            .map(|t| t.table_offset + t.header_extent())
            .max()
            .unwrap_or(0);
        let queue = self
            .pending
            .len_offset
            .unwrap_or(0)
            .max(self.pending.sentinel_pointer_offset)
            + POINTER_SIZE;
        tables.max(queue)
    }

    /// BLAKE3 digest of the canonical TOML rendering, hex encoded.
    pub fn fingerprint(&self) -> Result<String, ContractError> {
        let rendered = toml::to_string(self)?;
        Ok(hex::encode(blake3::hash(rendered.as_bytes()).as_bytes()))
    }
}
