//! Name table: a bucketed hash of red-black trees
//!
//! Keys hash with SipHash-1-3 under a fixed key; the low bits of the 32-bit
//! hash pick a bucket and the full hash feeds the bucket's tree comparator.
//! Bucket trees are allocated lazily on first insert. A table may chain to a
//! parent: lookups that miss locally fall through to the parent, writes and
//! removes never do.

use bitflags::bitflags;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::Arc;

use crate::error::Result;
use crate::tree::{Node, Tree, TreeOptions};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TableOptions: u32 {
        /// Fold ASCII case in hashing and comparison.
        const CASE_INSENSITIVE = 1 << 0;
    }
}

const HASH_KEY_0: u64 = 0x6772_6f75_6e64_776b;
const HASH_KEY_1: u64 = 0x6e61_6d65_7461_626c;

pub struct NameTable<V> {
    buckets: Vec<Option<Tree<V>>>,
    bucket_mask: u32,
    options: TableOptions,
    parent: Option<Arc<NameTable<V>>>,
}

impl<V> NameTable<V> {
    /// A table with `1 << log2_buckets` buckets.
    pub fn new(options: TableOptions, log2_buckets: u32) -> NameTable<V> {
        let count = 1usize << log2_buckets;
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, || None);
        NameTable {
            buckets,
            bucket_mask: (count - 1) as u32,
            options,
            parent: None,
        }
    }

    /// Chain a parent table for read fall-through.
    pub fn set_parent(&mut self, parent: Arc<NameTable<V>>) {
        self.parent = Some(parent);
    }

    /// The 32-bit key hash used for bucketing and tree ordering.
    pub fn key_hash(&self, key: &[u8]) -> u32 {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        if self.options.contains(TableOptions::CASE_INSENSITIVE) {
            for &byte in key {
                hasher.write_u8(byte.to_ascii_lowercase());
            }
        } else {
            hasher.write(key);
        }
        hasher.finish() as u32
    }

    fn tree_options(&self) -> TreeOptions {
        if self.options.contains(TableOptions::CASE_INSENSITIVE) {
            TreeOptions::CASE_INSENSITIVE
        } else {
            TreeOptions::empty()
        }
    }

    fn bucket_index(&self, hash: u32) -> usize {
        (hash & self.bucket_mask) as usize
    }

    pub fn set_value(&mut self, key: &[u8], value: V) -> Result<()> {
        let hash = self.key_hash(key);
        let index = self.bucket_index(hash);
        let options = self.tree_options();
        let tree = self.buckets[index].get_or_insert_with(|| Tree::with_options(options));
        tree.set_value(hash, key, value)
    }

    /// Store a caller-built node; the node must have been created with
    /// [`NameTable::make_node`] so its hash matches this table.
    pub fn set_value_ex(&mut self, node: Box<Node<V>>) -> Result<()> {
        let hash = node.key_hash();
        let index = self.bucket_index(hash);
        let options = self.tree_options();
        let tree = self.buckets[index].get_or_insert_with(|| Tree::with_options(options));
        tree.set_value_ex(node)
    }

    /// Build a detached node keyed for this table, for [`set_value_ex`].
    ///
    /// [`set_value_ex`]: NameTable::set_value_ex
    pub fn make_node(&self, key: &[u8], value: V) -> Box<Node<V>> {
        Node::with(self.key_hash(key), key, value)
    }

    /// Look up a key, falling through to the parent chain on a local miss.
    pub fn get_value(&self, key: &[u8]) -> Option<&V> {
        let hash = self.key_hash(key);
        let local = self.buckets[self.bucket_index(hash)]
            .as_ref()
            .and_then(|tree| tree.get_value(hash, key));
        match local {
            Some(value) => Some(value),
            None => self.parent.as_deref().and_then(|parent| parent.get_value(key)),
        }
    }

    /// Remove a key from this table only; the parent chain is untouched.
    pub fn remove_value(&mut self, key: &[u8]) -> bool {
        let hash = self.key_hash(key);
        let index = self.bucket_index(hash);
        match &mut self.buckets[index] {
            Some(tree) => tree.remove_value(hash, key),
            None => false,
        }
    }

    pub fn remove_all(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = None;
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().flatten().map(Tree::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate every bucket tree.
    pub fn check_state(&self) -> Result<()> {
        for tree in self.buckets.iter().flatten() {
            tree.check_state()?;
        }
        Ok(())
    }
}

// =============================================================================
// DICTIONARY ENTRIES
// =============================================================================
// A convenience layer for callers that register named constants, e.g. element
// names and the close markers that pair with them.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    pub name: String,
    pub close_tag: Option<String>,
}

pub type Dictionary = NameTable<DictEntry>;

impl NameTable<DictEntry> {
    /// Register a named entry with an optional close tag.
    pub fn add_entry(&mut self, name: &str, close_tag: Option<&str>) -> Result<()> {
        let entry = DictEntry {
            name: name.to_string(),
            close_tag: close_tag.map(str::to_string),
        };
        self.set_value(name.as_bytes(), entry)
    }

    /// Register a batch of plain names.
    pub fn add_entry_list(&mut self, names: &[&str]) -> Result<()> {
        for name in names {
            self.add_entry(name, None)?;
        }
        Ok(())
    }

    /// Find an entry here or anywhere up the parent chain.
    pub fn lookup_entry(&self, name: &str) -> Option<&DictEntry> {
        self.get_value(name.as_bytes())
    }
}
