use std::vec::IntoIter;

use crate::common::{Contact, Id};

/// Contacts ordered by XOR distance to a target, without duplicate ids.
#[derive(Debug, Clone)]
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Distance of the nearest contact to the target.
    pub fn closest_distance(&self) -> Option<Id> {
        self.contacts.first().map(|c| c.id().xor(&self.target))
    }

    // === Public Methods ===

    /// Insert a contact in order, returns `false` if its id is already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        let seek = contact.id().xor(&self.target);

        // Distances are unique per id, so an equal distance is the same contact.
        match self
            .contacts
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
        {
            Ok(_) => false,
            Err(pos) => {
                self.contacts.insert(pos, contact);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id() == id)?;

        Some(self.contacts.remove(index))
    }

    pub fn contains(&self, id: &Id) -> bool {
        let seek = id.xor(&self.target);

        self.contacts
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
            .is_ok()
    }

    /// The first `count` contacts, nearest first.
    pub fn take(&self, count: usize) -> Vec<Contact> {
        self.contacts.iter().take(count).copied().collect()
    }
}

impl IntoIterator for ClosestContacts {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestContacts {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}
