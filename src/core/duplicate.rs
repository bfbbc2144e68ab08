use crate::core::hash::hamming_distance;
use crate::core::ids::IdGenerator;
use crate::database::models::{ContentHash, DuplicateGroup, DuplicateGroupItem, HashType};
use crate::database::models::ScanQueueEntry;
use crate::database::repositories::{
    now, ContentHashRepository, DuplicateGroupRepository, ScanQueueRepository,
};
use crate::database::DatabaseError;
use log::{debug, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How two digests of one hash type are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// Identical values only, similarity 1.0.
    Exact,
    /// Bit vectors of `bits` bits, matching within `max_distance` differing bits.
    Hamming { max_distance: u32, bits: u32 },
}

impl MatchRule {
    /// Closeness of two digests in `[0, 1]`, regardless of the match
    /// threshold. `None` when the digests cannot be compared.
    pub fn score(&self, a: &str, b: &str) -> Option<f64> {
        match *self {
            MatchRule::Exact => Some(if a == b { 1.0 } else { 0.0 }),
            MatchRule::Hamming { bits, .. } => {
                let distance = Self::distance(a, b, bits)?;
                Some(1.0 - distance as f64 / bits as f64)
            }
        }
    }

    /// Similarity of two digests, or `None` when they do not match.
    pub fn similarity(&self, a: &str, b: &str) -> Option<f64> {
        match *self {
            MatchRule::Exact => (a == b).then_some(1.0),
            MatchRule::Hamming { max_distance, bits } => {
                let distance = Self::distance(a, b, bits)?;
                (distance <= max_distance).then(|| 1.0 - distance as f64 / bits as f64)
            }
        }
    }

    fn distance(a: &str, b: &str, bits: u32) -> Option<u32> {
        // Padding bits of a partial last nibble are always zero.
        let hex_len = bits.div_ceil(4) as usize;
        if bits == 0 || a.len() != hex_len {
            warn!("Skipping digest {:?}: expected {} hex chars", a, hex_len);
            return None;
        }
        match hamming_distance(a, b) {
            Ok(distance) => Some(distance),
            Err(e) => {
                warn!("Skipping incomparable digests: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub processed: usize,
    pub groups_created: usize,
    pub groups_updated: usize,
    pub groups_merged: usize,
}

/// Drains the scan queue and turns matches into duplicate groups.
///
/// A group's representative is its first item, the content that seeded it.
/// Every item's similarity is measured against the representative.
pub struct DuplicateGrouper {
    dhash_size: u32,
    dhash_max_distance: u32,
    ids: Arc<dyn IdGenerator>,
}

impl DuplicateGrouper {
    pub fn new(dhash_size: u32, dhash_max_distance: u32, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            dhash_size,
            dhash_max_distance,
            ids,
        }
    }

    pub fn rule_for(&self, hash_type: &HashType) -> MatchRule {
        match hash_type {
            HashType::DHash => MatchRule::Hamming {
                max_distance: self.dhash_max_distance,
                bits: self.dhash_size * self.dhash_size,
            },
            HashType::Sha256 | HashType::Other(_) => MatchRule::Exact,
        }
    }

    /// Compare every pending hash against the corpus in one transaction.
    /// Each processed entry leaves the queue whether or not it matched.
    pub fn scan(&self, conn: &Connection) -> Result<ScanSummary, DatabaseError> {
        let tx = conn.unchecked_transaction()?;
        let summary = self.scan_pending(&tx)?;
        tx.commit()?;

        info!(
            "Scan processed {} hashes: {} groups created, {} updated, {} merged",
            summary.processed,
            summary.groups_created,
            summary.groups_updated,
            summary.groups_merged
        );
        Ok(summary)
    }

    /// Measure every item of a group against its current representative
    /// again, e.g. after the previous representative was removed. Returns
    /// whether any similarity changed.
    pub fn refresh_group(&self, conn: &Connection, group_id: &str) -> Result<bool, DatabaseError> {
        let hashes = ContentHashRepository::new(conn);
        let groups = DuplicateGroupRepository::new(conn, self.ids.as_ref());
        Ok(self.rebase(&groups, &hashes, group_id)? > 0)
    }

    fn scan_pending(&self, conn: &Connection) -> Result<ScanSummary, DatabaseError> {
        let queue = ScanQueueRepository::new(conn);
        let hashes = ContentHashRepository::new(conn);
        let groups = DuplicateGroupRepository::new(conn, self.ids.as_ref());

        let mut corpus: HashMap<HashType, Vec<ContentHash>> = HashMap::new();
        let mut summary = ScanSummary::default();
        let mut updated: HashSet<String> = HashSet::new();

        for entry in queue.find_with_hash()? {
            let matches = self.find_matches(&entry, &hashes, &mut corpus)?;
            debug!(
                "{} hash {} of {} matched {} contents",
                entry.hash_type,
                entry.content_hash_id,
                entry.content_id,
                matches.len()
            );

            if !matches.is_empty() {
                self.link(&groups, &hashes, &entry, &matches, &mut summary, &mut updated)?;
            }

            queue.remove(entry.id)?;
            summary.processed += 1;
        }

        summary.groups_updated = updated.len();
        Ok(summary)
    }

    /// Other contents with a hash matching `entry`, in corpus order.
    fn find_matches(
        &self,
        entry: &ScanQueueEntry,
        hashes: &ContentHashRepository<'_>,
        corpus: &mut HashMap<HashType, Vec<ContentHash>>,
    ) -> Result<Vec<String>, DatabaseError> {
        let rule = self.rule_for(&entry.hash_type);
        let exact;
        let candidates: &[ContentHash] = match rule {
            MatchRule::Exact => {
                exact = hashes.find_by_type_and_value(&entry.hash_type, &entry.value)?;
                &exact
            }
            MatchRule::Hamming { .. } => {
                // Loaded once per scan and type.
                if !corpus.contains_key(&entry.hash_type) {
                    let loaded = hashes.find_by_type(&entry.hash_type)?;
                    corpus.insert(entry.hash_type.clone(), loaded);
                }
                corpus
                    .get(&entry.hash_type)
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
            }
        };

        let mut matches: Vec<String> = Vec::new();
        for candidate in candidates {
            if candidate.content_id == entry.content_id
                || matches.contains(&candidate.content_id)
            {
                continue;
            }
            if rule.similarity(&entry.value, &candidate.value).is_some() {
                matches.push(candidate.content_id.clone());
            }
        }
        Ok(matches)
    }

    /// Best score between any hash of `representative` and any hash of
    /// `content` under `hash_type`. Videos contribute one hash per frame.
    fn content_similarity(
        &self,
        hashes: &ContentHashRepository<'_>,
        hash_type: &HashType,
        representative: &str,
        content_id: &str,
    ) -> Result<f64, DatabaseError> {
        if representative == content_id {
            return Ok(1.0);
        }

        let rule = self.rule_for(hash_type);
        let of_type = |content_id: &str| -> Result<Vec<ContentHash>, DatabaseError> {
            let mut found = hashes.find_by_content_id(content_id)?;
            found.retain(|h| &h.hash_type == hash_type);
            Ok(found)
        };
        let reference = of_type(representative)?;
        let candidate = of_type(content_id)?;

        let best = reference
            .iter()
            .flat_map(|a| candidate.iter().filter_map(|b| rule.score(&a.value, &b.value)))
            .fold(0.0_f64, f64::max);
        Ok(best)
    }

    /// Recompute every item against the group's first item. Returns the
    /// number of items whose similarity changed.
    fn rebase(
        &self,
        groups: &DuplicateGroupRepository<'_>,
        hashes: &ContentHashRepository<'_>,
        group_id: &str,
    ) -> Result<usize, DatabaseError> {
        let Some(group) = groups.find_by_id(group_id)? else {
            return Ok(0);
        };
        let Some(representative) = group.items.first() else {
            return Ok(0);
        };

        let mut changed = 0;
        for item in &group.items {
            let similarity = self.content_similarity(
                hashes,
                &group.hash_type,
                &representative.content_id,
                &item.content_id,
            )?;
            if (similarity - item.similarity).abs() > f64::EPSILON
                && groups.update_similarity(&group.id, &item.content_id, similarity)?
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn link(
        &self,
        groups: &DuplicateGroupRepository<'_>,
        hashes: &ContentHashRepository<'_>,
        entry: &ScanQueueEntry,
        matches: &[String],
        summary: &mut ScanSummary,
        updated: &mut HashSet<String>,
    ) -> Result<(), DatabaseError> {
        let hash_type = &entry.hash_type;
        let members: Vec<&str> = std::iter::once(entry.content_id.as_str())
            .chain(matches.iter().map(String::as_str))
            .collect();

        let mut existing: Vec<DuplicateGroup> = Vec::new();
        for &content_id in &members {
            if let Some(group) = groups.find_by_content_id_and_hash_type(content_id, hash_type)? {
                if !existing.iter().any(|g| g.id == group.id) {
                    existing.push(group);
                }
            }
        }

        if existing.is_empty() {
            let mut items = Vec::with_capacity(members.len());
            for &content_id in &members {
                items.push(DuplicateGroupItem {
                    content_id: content_id.to_string(),
                    similarity: self.content_similarity(
                        hashes,
                        hash_type,
                        &entry.content_id,
                        content_id,
                    )?,
                });
            }

            let timestamp = now();
            let group = DuplicateGroup {
                id: groups.generate_id(),
                hash_type: hash_type.clone(),
                items,
                created_at: timestamp.clone(),
                updated_at: timestamp,
            };
            groups.save(&group)?;
            info!(
                "Created {} group {} with {} contents",
                group.hash_type,
                group.id,
                group.items.len()
            );
            summary.groups_created += 1;
            return Ok(());
        }

        existing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let target = existing.remove(0);
        let mut changed = false;

        for source in &existing {
            let moved = groups.merge_into(&target.id, &source.id)?;
            info!(
                "Merged group {} into {} ({} contents moved)",
                source.id, target.id, moved
            );
            updated.remove(&source.id);
            summary.groups_merged += 1;
            changed = true;
        }
        if !existing.is_empty() {
            // Moved items were measured against their old representative.
            self.rebase(groups, hashes, &target.id)?;
        }

        let representative = match target.items.first() {
            Some(item) => item.content_id.clone(),
            None => entry.content_id.clone(),
        };
        for &content_id in &members {
            if target.contains(content_id) {
                continue;
            }
            let item = DuplicateGroupItem {
                content_id: content_id.to_string(),
                similarity: self.content_similarity(
                    hashes,
                    hash_type,
                    &representative,
                    content_id,
                )?,
            };
            changed |= groups.add_item(&target.id, hash_type, &item)?;
        }

        if changed {
            updated.insert(target.id);
        }
        Ok(())
    }
}
