//! Memoization of work-item results (§4.4).

use std::collections::BTreeMap;
use std::collections::VecDeque;

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::step::Step;
use crate::model::attribute::Name;

/// Recursively sorts object keys and normalizes numeric representations so
/// the same logical value hashes identically across processes (§4.4
/// "Canonicalization").
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::String(format!("n:{i}"))
            } else if let Some(f) = n.as_f64() {
                Value::String(format!("n:{f}"))
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

fn sha256_hex(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// The subset of a catalog step's fields that determine memoization
/// identity; excludes `Name`, `ID`, `Labels` (§4.4).
fn step_functional(step: &Step) -> Value {
    let mut attributes: Vec<(&Name, &crate::model::step::AttributeSpec)> =
        step.attributes.iter().collect();
    attributes.sort_by_key(|(name, _)| (*name).clone());

    serde_json::json!({
        "step_type": step.step_type,
        "attributes": attributes,
        "predicate": step.predicate,
        "memoizable": step.memoizable,
    })
}

/// `SHA256(canonical(StepFunctional)) : SHA256(canonical(Inputs))`.
pub fn memo_key(step: &Step, inputs: &BTreeMap<Name, Value>) -> String {
    let functional = step_functional(step);
    let inputs_value = Value::Object(
        inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    format!("{}:{}", sha256_hex(&functional), sha256_hex(&inputs_value))
}

pub trait MemoCache: Send + Sync {
    fn get(&self, key: &str) -> Option<BTreeMap<Name, Value>>;
    fn put(&self, key: String, outputs: BTreeMap<Name, Value>);
}

struct Entry {
    key: String,
    outputs: BTreeMap<Name, Value>,
}

/// Bounded LRU cache guarded by a single `RwLock`, mirroring the
/// coarse-grained lock discipline the teacher uses for its shared
/// in-process state: concurrent reads never block each other, writes are
/// serialized and may evict.
pub struct LruMemoCache {
    capacity: usize,
    inner: RwLock<LruInner>,
}

struct LruInner {
    order: VecDeque<Entry>,
    index: BTreeMap<String, usize>,
}

impl LruMemoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(LruInner {
                order: VecDeque::new(),
                index: BTreeMap::new(),
            }),
        }
    }

    fn rebuild_index(order: &VecDeque<Entry>) -> BTreeMap<String, usize> {
        order
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect()
    }
}

impl MemoCache for LruMemoCache {
    fn get(&self, key: &str) -> Option<BTreeMap<Name, Value>> {
        let guard = self.inner.read();
        guard
            .index
            .get(key)
            .map(|&idx| guard.order[idx].outputs.clone())
    }

    fn put(&self, key: String, outputs: BTreeMap<Name, Value>) {
        let mut guard = self.inner.write();
        if guard.index.contains_key(&key) {
            guard.order.retain(|e| e.key != key);
        }
        guard.order.push_back(Entry {
            key: key.clone(),
            outputs,
        });
        while guard.order.len() > self.capacity {
            guard.order.pop_front();
        }
        let index = Self::rebuild_index(&guard.order);
        guard.index = index;
    }
}
