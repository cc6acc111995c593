// Companion index ("pre-fetch graph").
// Maps a primary key to an ordered, weighted set of companion keys that
// the enriched read path fetches alongside the primary. Read-mostly
// shared state; the per-key entry lock gives the single-writer-per-
// primary discipline. The index is volatile: it does not survive a
// restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::error::{Result, WarpError};

#[derive(Debug, Clone)]
struct Link {
    key: Vec<u8>,
    strength: f64,
    /// Insertion order within the primary, for stable tie-breaks.
    order: u64,
}

#[derive(Debug)]
struct IndexEntry {
    links: Vec<Link>,
    next_order: u64,
    #[allow(dead_code)]
    created_at: Instant,
    last_traversed: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanionMetrics {
    pub primaries: usize,
    pub total_companions: u64,
}

pub struct CompanionIndex {
    entries: DashMap<Vec<u8>, IndexEntry>,
    max_per_primary: usize,
    total_companions: AtomicU64,
}

impl CompanionIndex {
    pub fn new(max_per_primary: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_per_primary,
            total_companions: AtomicU64::new(0),
        }
    }

    /// Register companions for a primary. Declarations merge: an already
    /// known companion keeps the stronger strength, new ones append up
    /// to the per-primary cap, and on overflow the weakest are dropped.
    pub fn declare(
        &self,
        primary: &[u8],
        companions: &[Vec<u8>],
        strength: Option<f64>,
    ) -> Result<()> {
        let strength = strength.unwrap_or(1.0).clamp(0.0, 1.0);
        for companion in companions {
            if companion.as_slice() == primary {
                return Err(WarpError::InvalidArgument(
                    "a key cannot be its own companion".into(),
                ));
            }
        }

        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(primary.to_vec())
            .or_insert_with(|| IndexEntry {
                links: Vec::new(),
                next_order: 0,
                created_at: now,
                last_traversed: now,
            });

        let before = entry.links.len();
        for companion in companions {
            match entry.links.iter_mut().find(|l| &l.key == companion) {
                Some(link) => {
                    link.strength = link.strength.max(strength);
                }
                None => {
                    let order = entry.next_order;
                    entry.next_order += 1;
                    entry.links.push(Link {
                        key: companion.clone(),
                        strength,
                        order,
                    });
                }
            }
        }

        if entry.links.len() > self.max_per_primary {
            // Drop the weakest links; among equals the earliest declared
            // survive.
            entry.links.sort_by(|a, b| {
                b.strength
                    .partial_cmp(&a.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.order.cmp(&b.order))
            });
            entry.links.truncate(self.max_per_primary);
        }
        let after = entry.links.len();
        drop(entry);

        if after > before {
            self.total_companions
                .fetch_add((after - before) as u64, Ordering::Relaxed);
        } else if before > after {
            self.total_companions
                .fetch_sub((before - after) as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Companions of a primary in descending strength; ties keep their
    /// declaration order.
    pub fn lookup(&self, primary: &[u8]) -> Vec<(Vec<u8>, f64)> {
        let Some(mut entry) = self.entries.get_mut(primary) else {
            return Vec::new();
        };
        entry.last_traversed = Instant::now();
        let mut links = entry.links.clone();
        drop(entry);
        links.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.order.cmp(&b.order))
        });
        links.into_iter().map(|l| (l.key, l.strength)).collect()
    }

    /// Remove a primary and all of its links. Called automatically when
    /// the primary key is deleted from the store.
    pub fn forget(&self, primary: &[u8]) {
        if let Some((_, entry)) = self.entries.remove(primary) {
            self.total_companions
                .fetch_sub(entry.links.len() as u64, Ordering::Relaxed);
        }
    }

    /// Remove a single companion link.
    pub fn forget_companion(&self, primary: &[u8], companion: &[u8]) {
        let mut remove_primary = false;
        if let Some(mut entry) = self.entries.get_mut(primary) {
            let before = entry.links.len();
            entry.links.retain(|l| l.key != companion);
            let removed = before - entry.links.len();
            if removed > 0 {
                self.total_companions
                    .fetch_sub(removed as u64, Ordering::Relaxed);
            }
            remove_primary = entry.links.is_empty();
        }
        if remove_primary {
            self.entries.remove_if(primary, |_, e| e.links.is_empty());
        }
    }

    pub fn metrics(&self) -> CompanionMetrics {
        CompanionMetrics {
            primaries: self.entries.len(),
            total_companions: self.total_companions.load(Ordering::Relaxed),
        }
    }
}
