//! MurmurHash3 (x86, 32-bit) and the consistent-hash ring workers are placed on.

use std::collections::HashSet;

pub const DEFAULT_VIRTUAL_NODES: usize = 64;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

#[inline]
fn mix_k(mut k: u32) -> u32 {
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k.wrapping_mul(C2)
}

#[inline]
fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k = 0u32;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if let Some(first) = tail.first() {
        k ^= u32::from(*first);
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    fmix(h)
}

/// Ring of virtual nodes. Each member owns the arc ending at each of its
/// points, so removing a member only moves the keys it owned.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u32, String)>,
    virtual_nodes: usize,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            points: Vec::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn insert(&mut self, member: &str) {
        if self.contains(member) {
            return;
        }
        for v in 0..self.virtual_nodes {
            let point = murmur3_32(format!("{member}#{v}").as_bytes(), 0);
            self.points.push((point, member.to_string()));
        }
        self.points.sort();
    }

    pub fn remove(&mut self, member: &str) {
        self.points.retain(|(_, m)| m != member);
    }

    pub fn contains(&self, member: &str) -> bool {
        self.points.iter().any(|(_, m)| m == member)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distinct members in ring order, starting at the first point at or
    /// after `hash` and wrapping around.
    pub fn walk(&self, hash: u32) -> Vec<&str> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let start = self.points.partition_point(|(point, _)| *point < hash);
        self.walk_from_index(start)
    }

    /// Same walk as [`HashRing::walk`], starting at an arbitrary point index.
    pub fn walk_from_index(&self, start: usize) -> Vec<&str> {
        let len = self.points.len();
        if len == 0 {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for offset in 0..len {
            let member = self.points[(start + offset) % len].1.as_str();
            if seen.insert(member) {
                order.push(member);
            }
        }
        order
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}
