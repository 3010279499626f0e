//! Set-associative key/value storage with pluggable replacement.
//!
//! `Table` is a single fully-associative set; `TagStore` indexes an array of tables by block
//! tag. Callers pass a `PolicySignal` with every insertion and read; the replacement policy
//! decides what the signal means for retention.

pub mod eaf;
pub mod policy;
pub mod victim;

use std::collections::HashMap;
use std::hash::Hash;

use log::warn;

use crate::base::error::{ensure_config, SimResult};
use policy::{build_policy, ReplacementPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicySignal {
    High,
    Bimodal,
    Low,
}

impl PolicySignal {
    /// Numeric encoding used by config files: 0 high, 1 bimodal, 2 low.
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::High),
            1 => Some(Self::Bimodal),
            2 => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Insert,
    Read,
    Update,
    Replace,
    Invalidate,
}

/// A key/value pair removed from a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

#[derive(Debug)]
pub struct Table<K, V> {
    slots: Vec<Option<Entry<K, V>>>,
    index: HashMap<K, usize>,
    policy: Box<dyn ReplacementPolicy>,
}

impl<K, V> Table<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new(ways: usize, policy: Box<dyn ReplacementPolicy>) -> Self {
        Self {
            slots: (0..ways).map(|_| None).collect(),
            index: HashMap::with_capacity(ways),
            policy,
        }
    }

    pub fn with_policy(ways: usize, policy: &str) -> SimResult<Self> {
        Ok(Self::new(ways, build_policy(policy, ways)?))
    }

    pub fn ways(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.index.len() == self.slots.len()
    }

    /// Presence test without touching replacement state.
    pub fn lookup(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn way_of(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let way = self.way_of(key)?;
        self.slots[way].as_ref().map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let way = self.way_of(key)?;
        self.slots[way].as_mut().map(|e| &mut e.value)
    }

    /// Access that counts as a use for the replacement policy.
    pub fn read(&mut self, key: &K, signal: PolicySignal) -> Option<&mut V> {
        let way = self.way_of(key)?;
        self.policy.update(way, TableOp::Read, signal);
        self.slots[way].as_mut().map(|e| &mut e.value)
    }

    /// Re-apply insertion priority to a resident entry. Returns false when absent.
    pub fn reinsert(&mut self, key: &K, signal: PolicySignal) -> bool {
        match self.way_of(key) {
            Some(way) => {
                self.policy.update(way, TableOp::Replace, signal);
                true
            }
            None => false,
        }
    }

    /// Insert `key`, evicting a victim if the table is full. Inserting a present key replaces
    /// its value in place and evicts nothing.
    pub fn insert(&mut self, key: K, value: V, signal: PolicySignal) -> Option<Entry<K, V>> {
        if let Some(way) = self.way_of(&key) {
            self.slots[way] = Some(Entry { key, value });
            self.policy.update(way, TableOp::Update, signal);
            return None;
        }

        if let Some(way) = self.slots.iter().position(Option::is_none) {
            self.slots[way] = Some(Entry { key, value });
            self.index.insert(key, way);
            self.policy.update(way, TableOp::Insert, signal);
            return None;
        }

        let way = match self.policy.victim() {
            Some(way) if way < self.slots.len() => way,
            other => {
                warn!("replacement policy gave no usable victim ({:?}), evicting way 0", other);
                0
            }
        };
        let evicted = self.slots[way].replace(Entry { key, value });
        if let Some(old) = &evicted {
            self.index.remove(&old.key);
        }
        self.index.insert(key, way);
        self.policy.update(way, TableOp::Replace, signal);
        evicted
    }

    pub fn invalidate(&mut self, key: &K) -> Option<Entry<K, V>> {
        let way = self.index.remove(key)?;
        self.policy.update(way, TableOp::Invalidate, PolicySignal::Low);
        self.slots[way].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.slots.iter().flatten()
    }

    /// Values in way order; replacement state is untouched.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().flatten().map(|e| &mut e.value)
    }
}

/// Set-indexed tag store keyed by block number.
#[derive(Debug)]
pub struct TagStore<V> {
    sets: Vec<Table<u64, V>>,
}

impl<V> TagStore<V> {
    pub fn new(num_sets: usize, ways: usize, policy: &str) -> SimResult<Self> {
        ensure_config!(num_sets > 0, "tagstore", "set count must be positive");
        ensure_config!(ways > 0, "tagstore", "associativity must be positive");
        let sets = (0..num_sets)
            .map(|_| Table::with_policy(ways, policy))
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self { sets })
    }

    /// Geometry of a cache of `size_kb` kilobytes.
    pub fn with_geometry(size_kb: u64, block_size: u64, ways: usize, policy: &str) -> SimResult<Self> {
        ensure_config!(
            block_size > 0 && ways > 0,
            "tagstore",
            "block size and associativity must be positive"
        );
        let sets = size_kb * 1024 / (block_size * ways as u64);
        Self::new(sets as usize, ways, policy)
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn ways(&self) -> usize {
        self.sets[0].ways()
    }

    pub fn index(&self, tag: u64) -> usize {
        (tag % self.sets.len() as u64) as usize
    }

    pub fn set(&self, index: usize) -> &Table<u64, V> {
        &self.sets[index]
    }

    fn set_for(&mut self, tag: u64) -> &mut Table<u64, V> {
        let index = self.index(tag);
        &mut self.sets[index]
    }

    pub fn lookup(&self, tag: u64) -> bool {
        self.sets[self.index(tag)].lookup(&tag)
    }

    pub fn get(&self, tag: u64) -> Option<&V> {
        self.sets[self.index(tag)].get(&tag)
    }

    pub fn get_mut(&mut self, tag: u64) -> Option<&mut V> {
        self.set_for(tag).get_mut(&tag)
    }

    pub fn read(&mut self, tag: u64, signal: PolicySignal) -> Option<&mut V> {
        self.set_for(tag).read(&tag, signal)
    }

    pub fn reinsert(&mut self, tag: u64, signal: PolicySignal) -> bool {
        self.set_for(tag).reinsert(&tag, signal)
    }

    pub fn insert(&mut self, tag: u64, value: V, signal: PolicySignal) -> Option<Entry<u64, V>> {
        self.set_for(tag).insert(tag, value, signal)
    }

    pub fn invalidate(&mut self, tag: u64) -> Option<Entry<u64, V>> {
        self.set_for(tag).invalidate(&tag)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.sets.iter_mut().flat_map(|set| set.values_mut())
    }

    pub fn len(&self) -> usize {
        self.sets.iter().map(Table::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(Table::is_empty)
    }
}
