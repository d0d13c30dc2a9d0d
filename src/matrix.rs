//! Pixel activation order for the progress matrix
//!
//! A level's progress lights cells in a fixed random order: the first
//! `progress * N / 10000` entries of a permutation of `0..N`. Seeding makes the
//! order reproducible; the order for the current level is cached on disk.

use crate::logging::{log_error, log_store};
use crate::store::write_atomic;
use rand::{Rng, RngCore};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_WIDTH: u32 = 160;
pub const DEFAULT_HEIGHT: u32 = 120;

/// Progress units per level, matching XP per level
pub const PROGRESS_SCALE: u64 = 10_000;

/// Substituted for a zero seed, which would pin xorshift at zero forever
const ZERO_SEED_REPLACEMENT: u64 = 0x9E37_79B9_7F4A_7C15;

// ============ Seeded Generator ============

/// xorshift64 (13, 7, 17); fast and reproducible, not cryptographic
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { ZERO_SEED_REPLACEMENT } else { seed };
        Self { state }
    }
}

impl RngCore for Xorshift64 {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

// ============ Permutation ============

/// Number of cells in a `width x height` matrix
pub fn cell_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// Fisher-Yates permutation of `0..total`, reproducible when seeded
pub fn shuffle(total: usize, seed: Option<u64>) -> Vec<u32> {
    let mut order: Vec<u32> = (0..total as u32).collect();
    match seed {
        Some(seed) => shuffle_with(&mut order, &mut Xorshift64::new(seed)),
        None => shuffle_with(&mut order, &mut rand::rng()),
    }
    order
}

fn shuffle_with<R: Rng + ?Sized>(order: &mut [u32], rng: &mut R) {
    for i in (1..order.len()).rev() {
        let j = rng.random_range(0..=i);
        order.swap(i, j);
    }
}

/// How many cells are lit at `progress` (0..=10000) out of `total`
pub fn active_count(total: usize, progress: u32) -> usize {
    let lit = u64::from(progress) * total as u64 / PROGRESS_SCALE;
    (lit as usize).min(total)
}

/// The lit prefix of `order` at `progress`
pub fn active_cells(order: &[u32], progress: u32) -> HashSet<u32> {
    let count = active_count(order.len(), progress);
    order[..count].iter().copied().collect()
}

/// `order` has exactly `total` distinct values, all below `total`
pub fn is_valid_permutation(order: &[u32], total: usize) -> bool {
    if order.len() != total {
        return false;
    }
    let mut seen = vec![false; total];
    for &cell in order {
        let idx = cell as usize;
        if idx >= total || seen[idx] {
            return false;
        }
        seen[idx] = true;
    }
    true
}

// ============ Activation Order Cache ============

/// `activation_order.bin`: the order as little-endian u32s
#[derive(Debug, Clone)]
pub struct ActivationOrderStore {
    path: PathBuf,
    total: usize,
}

impl ActivationOrderStore {
    pub fn new(path: impl Into<PathBuf>, total: usize) -> Self {
        Self {
            path: path.into(),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached order, or `None` if absent or not a valid permutation
    pub fn load(&self) -> Option<Vec<u32>> {
        let bytes = fs::read(&self.path).ok()?;
        if bytes.len() % 4 != 0 {
            log_error(None, "activation_order.bin has a ragged length, discarding");
            return None;
        }

        let order: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        if !is_valid_permutation(&order, self.total) {
            log_error(None, "activation_order.bin is not a valid permutation, discarding");
            return None;
        }
        Some(order)
    }

    pub fn save(&self, order: &[u32]) {
        let bytes: Vec<u8> = order.iter().flat_map(|cell| cell.to_le_bytes()).collect();
        match write_atomic(&self.path, &bytes) {
            Ok(()) => log_store(None, &format!("Saved activation order ({} cells)", order.len())),
            Err(e) => log_error(None, &format!("Failed to save activation order: {}", e)),
        }
    }

    /// Cached order, or a fresh unseeded one that is then cached
    pub fn load_or_shuffle(&self) -> Vec<u32> {
        if let Some(order) = self.load() {
            return order;
        }
        self.reshuffle()
    }

    /// New unseeded order for the next level
    pub fn reshuffle(&self) -> Vec<u32> {
        let order = shuffle(self.total, None);
        self.save(&order);
        order
    }
}
