//! Temporal grains and partition addressing.
//!
//! A partition is the vector table holding one agent's facts at one temporal
//! granularity. The mapping from (agent, grain) to a storage address and a
//! queue ordering key is pure: no I/O, no state.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Partitioning granularity for an agent's memory facts.
///
/// Grains are ordered from the shortest horizon to the longest; `Docs` is the
/// partition for document-derived memories and sorts after the time-based
/// grains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalGrain {
    Working,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    Docs,
}

impl TemporalGrain {
    /// All grains, in order.
    pub const ALL: [TemporalGrain; 7] = [
        Self::Working,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Quarterly,
        Self::Yearly,
        Self::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
            Self::Docs => "docs",
        }
    }
}

impl std::fmt::Display for TemporalGrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TemporalGrain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(Self::Working),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            "docs" => Ok(Self::Docs),
            _ => Err(format!("Invalid temporal grain: {}", s)),
        }
    }
}

/// Address of one partition: (agent, grain).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionRef {
    pub agent_id: String,
    pub grain: TemporalGrain,
}

impl PartitionRef {
    pub fn new(agent_id: impl Into<String>, grain: TemporalGrain) -> Self {
        Self {
            agent_id: agent_id.into(),
            grain,
        }
    }

    /// Storage address: the vector table name for this partition.
    ///
    /// Agent ids are sanitized for the backend's table-name charset. When
    /// sanitizing loses information, a short content hash of the original id
    /// keeps distinct agents from colliding on one table.
    pub fn table_name(&self) -> String {
        let sanitized = sanitize_identifier(&self.agent_id);
        if sanitized == self.agent_id {
            format!("mem_{}_{}", sanitized, self.grain.as_str())
        } else {
            let digest = Sha256::digest(self.agent_id.as_bytes());
            let tag = hex_prefix(&digest, 8);
            format!("mem_{}_{}_{}", sanitized, tag, self.grain.as_str())
        }
    }

    /// Queue ordering key: messages sharing this key are delivered in order,
    /// serializing all operations against one partition.
    pub fn ordering_key(&self) -> String {
        format!("{}/{}", self.agent_id, self.grain.as_str())
    }
}

impl std::fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.grain)
    }
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
