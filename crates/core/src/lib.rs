//! cfgsync core types: object identities, process requests, partition planning
//! and the seams between ingestion, translation and the downstream store.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;
// Second seed so non-UUID identities still get two independent halves.
const FNV_ALT_OFFSET: u64 = FNV_OFFSET ^ 0x9e3779b97f4a7c15;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Identity of a source object (`metadata.uid`).
///
/// The source text is kept for ordering, display and search. The two 64-bit
/// halves are the big-endian halves of the UUID when the text is one, or two
/// FNV-1a digests of the text otherwise.
#[derive(Clone)]
pub struct Uid {
    text: Arc<str>,
    halves: [u64; 2],
}

impl Uid {
    pub fn parse(text: &str) -> Self {
        let halves = match uuid::Uuid::parse_str(text) {
            Ok(u) => {
                let v = u.as_u128();
                [(v >> 64) as u64, v as u64]
            }
            Err(_) => [
                fnv1a(FNV_OFFSET, text.as_bytes()),
                fnv1a(FNV_ALT_OFFSET, text.as_bytes()),
            ],
        };
        Self { text: Arc::from(text), halves }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Most-significant half first.
    pub fn halves(&self) -> [u64; 2] {
        self.halves
    }

    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.halves[0].to_be_bytes());
        out[8..].copy_from_slice(&self.halves[1].to_be_bytes());
        out
    }
}

impl PartialEq for Uid {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Uid {}

impl Hash for Uid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.cmp(&other.text)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.text)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Uid::parse(&s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Map a watch event type to an operation. `ERROR` and unknown types map to `None`.
    pub fn from_event_type(ty: &str) -> Option<Self> {
        match ty {
            "ADDED" => Some(Operation::Create),
            "MODIFIED" => Some(Operation::Update),
            "DELETED" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work posted into the partition pipeline.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub op: Operation,
    pub uid: Uid,
    pub value: serde_json::Value,
}

impl ProcessRequest {
    pub fn new(op: Operation, uid: Uid, value: serde_json::Value) -> Self {
        Self { op, uid, value }
    }
}

/// Static description of a served kind, as returned by API discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KindInfo {
    /// Resource path segment, e.g. `virtualnetworks`.
    pub name: String,
    #[serde(default)]
    pub singular_name: String,
    #[serde(default)]
    pub namespaced: bool,
    pub kind: String,
}

impl KindInfo {
    pub fn is_status_subresource(&self) -> bool {
        self.name.ends_with("/status")
    }
}

/// Recovery class of a failure. Every failure maps to exactly one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureClass {
    /// Reconnect or retry the same operation after a delay.
    TransientRetry,
    /// Cursor continuity is lost; every kind must be re-listed.
    ResyncRequired,
    /// Confined to one identity; handled by that identity's retry timer.
    IdentityRetry,
}

pub trait Classify {
    fn classify(&self) -> FailureClass;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("object is not a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl Classify for TranslateError {
    fn classify(&self) -> FailureClass {
        FailureClass::IdentityRetry
    }
}

/// Canonical output for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub record: serde_json::Value,
    /// list/map property -> is empty
    pub empty_props: BTreeMap<String, bool>,
}

/// Converts a raw source object into the canonical schema.
pub trait Translator: Send + Sync {
    fn translate(&self, uid: &Uid, raw: &serde_json::Value) -> Result<Translated, TranslateError>;
}

/// Entry point shared by bulk sync and watch lines. Must be safe for concurrent callers.
pub trait Dispatcher: Send + Sync {
    fn enqueue(&self, req: ProcessRequest);
}

/// Downstream consumer of canonical records.
pub trait ConfigSink: Send + Sync {
    /// For `Delete` the record is the last applied canonical document.
    fn on_object(&self, uid: &Uid, record: &serde_json::Value, op: Operation);

    fn on_bulk_sync_complete(&self, kind: &str);
}

/// Maps identities onto a fixed number of partitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionPlanner {
    partitions: usize,
}

impl PartitionPlanner {
    pub fn new(partitions: usize) -> Self {
        Self { partitions: partitions.max(1) }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// FNV-1a over the big-endian identity bytes, modulo the partition count.
    pub fn partition_of(&self, uid: &Uid) -> usize {
        if self.partitions <= 1 {
            return 0;
        }
        (fnv1a(FNV_OFFSET, &uid.to_be_bytes()) % self.partitions as u64) as usize
    }
}

pub mod prelude {
    pub use super::{
        Classify, ConfigSink, Dispatcher, FailureClass, KindInfo, Operation, PartitionPlanner,
        ProcessRequest, TranslateError, Translated, Translator, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_halves_are_big_endian() {
        let uid = Uid::parse("00112233-4455-6677-8899-aabbccddeeff");
        assert_eq!(uid.halves(), [0x0011223344556677, 0x8899aabbccddeeff]);
        assert_eq!(uid.to_be_bytes()[0], 0x00);
        assert_eq!(uid.to_be_bytes()[15], 0xff);
    }

    #[test]
    fn non_uuid_identity_is_accepted_and_stable() {
        let a = Uid::parse("X");
        let b = Uid::parse("X");
        assert_eq!(a, b);
        assert_eq!(a.halves(), b.halves());
        assert_ne!(a.halves()[0], a.halves()[1]);
        assert_eq!(a.to_string(), "X");
    }

    #[test]
    fn partition_assignment_is_deterministic_and_in_range() {
        let planner = PartitionPlanner::new(7);
        for i in 0..200u32 {
            let uid = Uid::parse(&format!("00000000-0000-0000-0000-{:012}", i));
            let p = planner.partition_of(&uid);
            assert!(p < 7);
            assert_eq!(p, planner.partition_of(&uid.clone()));
            assert_eq!(p, PartitionPlanner::new(7).partition_of(&Uid::parse(uid.as_str())));
        }
    }

    #[test]
    fn partitions_spread_across_workers() {
        let planner = PartitionPlanner::new(4);
        let mut seen = [0usize; 4];
        for i in 0..400u32 {
            seen[planner.partition_of(&Uid::parse(&format!("obj-{i}")))] += 1;
        }
        assert!(seen.iter().all(|c| *c > 0), "every partition should get work: {:?}", seen);
    }

    #[test]
    fn zero_partitions_clamps_to_one() {
        let planner = PartitionPlanner::new(0);
        assert_eq!(planner.partitions(), 1);
        assert_eq!(planner.partition_of(&Uid::parse("anything")), 0);
    }

    #[test]
    fn event_types_map_to_operations() {
        assert_eq!(Operation::from_event_type("ADDED"), Some(Operation::Create));
        assert_eq!(Operation::from_event_type("MODIFIED"), Some(Operation::Update));
        assert_eq!(Operation::from_event_type("DELETED"), Some(Operation::Delete));
        assert_eq!(Operation::from_event_type("ERROR"), None);
        assert_eq!(Operation::from_event_type("BOOKMARK"), None);
    }

    #[test]
    fn kind_info_reads_discovery_entry() {
        let v = serde_json::json!({
            "name": "virtualnetworks/status",
            "singularName": "",
            "namespaced": true,
            "kind": "VirtualNetwork",
            "verbs": ["get", "patch"]
        });
        let k: KindInfo = serde_json::from_value(v).expect("kind info");
        assert!(k.is_status_subresource());
        assert!(k.namespaced);
    }
}
