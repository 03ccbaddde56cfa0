//! Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{Contact, Id, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of [RoutingTable::add].
pub enum AddOutcome {
    /// The contact was appended as the most recently seen.
    Inserted,
    /// The contact was already known, it moved to the most recently seen position.
    Updated,
    /// The bucket is full, `least_recently_seen` is the eviction candidate.
    Full { least_recently_seen: Contact },
    /// Contacts with our own id are never added.
    Rejected,
}

#[derive(Debug, Clone)]
/// Distance-banded buckets of [Contact]s, relative to a local [Id].
///
/// Bucket `i` holds contacts whose most significant bit differing from the
/// local id is bit `i`, so lower indices are farther away. Buckets are created
/// lazily, an absent index is an empty bucket that was never touched.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<usize, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and the default bucket size.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] with buckets of at most `k` contacts.
    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k: k.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Maximum number of contacts per bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns the bucket at `index` if it was ever created.
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(&index)
    }

    // === Public Methods ===

    /// Attempts to add a contact to this routing table.
    ///
    /// Known contacts move to the tail of their bucket with their address
    /// refreshed. A full bucket is left untouched, the caller decides whether
    /// the returned least recently seen contact should be evicted.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        let index = match self.id.bucket_index(contact.id()) {
            Some(index) => index,
            None => return AddOutcome::Rejected,
        };

        let k = self.k;
        self.buckets.entry(index).or_default().add(contact, k)
    }

    /// Replace `stale` with `replacement` in their shared bucket.
    ///
    /// Returns `false` if `stale` was already gone and the bucket is still full.
    pub fn evict(&mut self, stale: &Id, replacement: Contact) -> bool {
        self.remove(stale);

        matches!(
            self.add(replacement),
            AddOutcome::Inserted | AddOutcome::Updated
        )
    }

    /// Remove a contact from this routing table, no-op if it is absent.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.id.bucket_index(id)?;

        self.buckets.get_mut(&index)?.remove(id)
    }

    /// Returns the contact with this id if it is in the table.
    pub fn get(&self, id: &Id) -> Option<&Contact> {
        let index = self.id.bucket_index(id)?;

        self.buckets.get(&index)?.get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Return up to `count` contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Contact> {
        self.closest_excluding(target, count, None)
    }

    /// Same as [Self::closest] but never returns `excluded`, usually the
    /// id of the requester.
    ///
    /// Buckets are scanned outward from the bucket of `target`: the exact
    /// bucket first, then every nearer bucket (they share one distance band
    /// to the target), then each farther bucket in turn. The scan stops once a
    /// whole band has been collected and `count` is satisfied.
    pub fn closest_excluding(
        &self,
        target: &Id,
        count: usize,
        excluded: Option<&Id>,
    ) -> Vec<Contact> {
        let mut result: Vec<Contact> = Vec::with_capacity(count);

        if count == 0 {
            return result;
        }

        let start = self.id.bucket_index(target).unwrap_or(ID_BITS - 1);

        let collect = |result: &mut Vec<Contact>, bucket: &KBucket| {
            result.extend(
                bucket
                    .iter()
                    .filter(|contact| Some(contact.id()) != excluded)
                    .copied(),
            )
        };

        if let Some(bucket) = self.buckets.get(&start) {
            collect(&mut result, bucket);
        }

        for (_, bucket) in self.buckets.range(start + 1..) {
            collect(&mut result, bucket);
        }

        for (_, bucket) in self.buckets.range(..start).rev() {
            if result.len() >= count {
                break;
            }
            collect(&mut result, bucket);
        }

        result.sort_by_key(|contact| contact.id().xor(target));
        result.truncate(count);

        result
    }

    /// Index of the nearest non-empty bucket.
    pub fn closest_bucket_index(&self) -> Option<usize> {
        self.buckets
            .iter()
            .rev()
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(index, _)| *index)
    }

    /// Indices in `0..=up_to` whose bucket was not touched within `interval`.
    /// Empty buckets are always stale.
    pub fn stale_buckets(&self, up_to: usize, interval: Duration) -> Vec<usize> {
        (0..=up_to.min(ID_BITS - 1))
            .filter(|index| match self.buckets.get(index) {
                Some(bucket) => bucket.is_empty() || bucket.last_touched.elapsed() >= interval,
                None => true,
            })
            .collect()
    }

    /// Mark the bucket at `index` as freshly explored.
    pub fn touch_bucket(&mut self, index: usize) {
        if index < ID_BITS {
            self.buckets.entry(index).or_default().last_touched = Instant::now();
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the contacts in this routing table, farthest
    /// bucket first.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn to_owned_contacts(&self) -> Vec<Contact> {
        self.contacts().copied().collect()
    }
}

/// A bounded list of contacts ordered from least to most recently seen.
#[derive(Debug, Clone)]
pub struct KBucket {
    contacts: Vec<Contact>,
    last_touched: Instant,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    // === Getters ===

    /// The eviction candidate.
    pub fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Private Methods ===

    fn add(&mut self, incoming: Contact, k: usize) -> AddOutcome {
        if let Some(index) = self.contacts.iter().position(|c| c == &incoming) {
            // Possibly updating the address, which is fresher than what we had.
            self.contacts.remove(index);
            self.contacts.push(incoming);
            self.last_touched = Instant::now();

            AddOutcome::Updated
        } else if self.contacts.len() < k {
            self.contacts.push(incoming);
            self.last_touched = Instant::now();

            AddOutcome::Inserted
        } else {
            AddOutcome::Full {
                least_recently_seen: self.contacts[0],
            }
        }
    }

    fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id() == id)?;

        Some(self.contacts.remove(index))
    }

    fn get(&self, id: &Id) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id() == id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}
