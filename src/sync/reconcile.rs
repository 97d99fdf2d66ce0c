//! Reconcile a fresh scan against the known catalog.
//!
//! Rows are never deleted. A known test matches a scanned one by (file, name)
//! first, then by name alone (the test moved files). Unmatched scans become
//! new rows; unmatched known tests become unavailable. Only rows whose stored
//! fields actually change produce a write, so a repeated scan is a no-op.

use std::collections::HashSet;

use crate::model::{DiscoveredTest, DiscoveryChange, Id};

/// A test identifier found on disk during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedTest {
    pub name: String,
    pub relative_file_path: String,
}

pub fn reconcile(existing: &[DiscoveredTest], scanned: &[ScannedTest]) -> Vec<DiscoveryChange> {
    let mut by_id: Vec<&DiscoveredTest> = existing.iter().collect();
    by_id.sort_by_key(|t| t.id);

    let mut used: HashSet<Id> = HashSet::new();
    let mut matches: Vec<Option<&DiscoveredTest>> = vec![None; scanned.len()];

    for (slot, scan) in matches.iter_mut().zip(scanned) {
        if let Some(hit) = by_id.iter().find(|t| {
            !used.contains(&t.id) && t.name == scan.name && t.relative_file_path == scan.relative_file_path
        }) {
            used.insert(hit.id);
            *slot = Some(*hit);
        }
    }
    for (slot, scan) in matches.iter_mut().zip(scanned) {
        if slot.is_some() {
            continue;
        }
        if let Some(hit) = by_id.iter().find(|t| !used.contains(&t.id) && t.name == scan.name) {
            used.insert(hit.id);
            *slot = Some(*hit);
        }
    }

    let mut changes = Vec::new();
    for (slot, scan) in matches.iter().zip(scanned) {
        match slot {
            Some(known) => {
                if known.relative_file_path != scan.relative_file_path || !known.is_available {
                    changes.push(DiscoveryChange::Update {
                        id: known.id,
                        relative_file_path: scan.relative_file_path.clone(),
                        is_available: true,
                    });
                }
            }
            None => changes.push(DiscoveryChange::Insert {
                name: scan.name.clone(),
                relative_file_path: scan.relative_file_path.clone(),
            }),
        }
    }

    for known in by_id {
        if !used.contains(&known.id) && known.is_available {
            changes.push(DiscoveryChange::Update {
                id: known.id,
                relative_file_path: known.relative_file_path.clone(),
                is_available: false,
            });
        }
    }
    changes
}
