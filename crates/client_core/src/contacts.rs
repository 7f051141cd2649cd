//! Contact list and user directory.
//!
//! This is the only place that knows user records may identify the same
//! person through either `_id` or `uid`. Records are collapsed to one
//! canonical [`UserId`] here (`_id` wins when both are present) and the
//! other value is kept in an alias table so that pushed messages addressed
//! through the secondary field still resolve to the right contact.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{Role, UserId},
    protocol::{ContactsResponse, DirectoryResponse, UserRecord},
};
use tracing::warn;

use crate::{error::OperationError, types::Contact};

fn non_empty(id: &Option<UserId>) -> Option<UserId> {
    id.as_ref().filter(|id| !id.as_str().is_empty()).cloned()
}

/// Collapses a user record into a contact plus the secondary identity the
/// record carried, if it differs from the canonical one.
pub fn normalize_user(record: &UserRecord, role: Option<Role>) -> Option<(Contact, Option<UserId>)> {
    let primary = non_empty(&record.id);
    let secondary = non_empty(&record.uid);
    let (identity, alias) = match (primary, secondary) {
        (Some(primary), Some(secondary)) if primary != secondary => (primary, Some(secondary)),
        (Some(primary), _) => (primary, None),
        (None, Some(secondary)) => (secondary, None),
        (None, None) => return None,
    };

    let display_name = record
        .name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| record.username.clone())
        .unwrap_or_else(|| identity.to_string());

    Some((
        Contact {
            identity,
            display_name,
            handle: record.username.clone(),
            avatar_ref: record.avatar.clone(),
            role: role.or(record.role).unwrap_or_default(),
            has_unread: false,
        },
        alias,
    ))
}

#[derive(Debug, Default)]
struct UserList {
    entries: Vec<Contact>,
    aliases: HashMap<UserId, UserId>,
    inflight: usize,
    error: Option<OperationError>,
}

impl UserList {
    fn begin(&mut self) {
        self.inflight += 1;
    }

    fn replace<'a>(
        &mut self,
        records: impl Iterator<Item = (&'a UserRecord, Option<Role>)>,
    ) -> usize {
        let unread: HashSet<UserId> = self
            .entries
            .iter()
            .filter(|entry| entry.has_unread)
            .map(|entry| entry.identity.clone())
            .collect();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut aliases = HashMap::new();
        for (record, role) in records {
            let Some((mut contact, alias)) = normalize_user(record, role) else {
                warn!("contacts: dropping user record without identity");
                continue;
            };
            if !seen.insert(contact.identity.clone()) {
                continue;
            }
            if let Some(alias) = alias {
                aliases.insert(alias, contact.identity.clone());
            }
            // Unread markers belong to the unread tracker and outlive a refresh.
            contact.has_unread = unread.contains(&contact.identity);
            entries.push(contact);
        }
        self.entries = entries;
        self.aliases = aliases;
        self.error = None;
        self.inflight = self.inflight.saturating_sub(1);
        self.entries.len()
    }

    fn fail(&mut self, error: OperationError) {
        self.error = Some(error);
        self.inflight = self.inflight.saturating_sub(1);
    }

    fn find(&self, identity: &UserId) -> Option<&Contact> {
        self.entries.iter().find(|entry| &entry.identity == identity)
    }

    /// The identity this list files `id` under, either directly or through
    /// an alias.
    fn lookup(&self, id: &UserId) -> Option<UserId> {
        match self.find(id) {
            Some(entry) => Some(entry.identity.clone()),
            None => self.aliases.get(id).cloned(),
        }
    }

    /// Every id this list knows for `identity`.
    fn ids_for<'a>(&'a self, identity: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        std::iter::once(identity).chain(
            self.aliases
                .iter()
                .filter(move |(_, canonical)| *canonical == identity)
                .map(|(alias, _)| alias),
        )
    }
}

/// Contact list plus the searchable directory of every addressable user.
///
/// Both lists are replaced wholesale on a successful refresh and left
/// untouched on failure, each with its own error slot.
#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: UserList,
    directory: UserList,
}

impl ContactDirectory {
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts.entries
    }

    pub fn users(&self) -> &[Contact] {
        &self.directory.entries
    }

    pub fn contacts_loading(&self) -> bool {
        self.contacts.inflight > 0
    }

    pub fn directory_loading(&self) -> bool {
        self.directory.inflight > 0
    }

    pub fn contacts_error(&self) -> Option<&OperationError> {
        self.contacts.error.as_ref()
    }

    pub fn directory_error(&self) -> Option<&OperationError> {
        self.directory.error.as_ref()
    }

    pub fn begin_contacts_refresh(&mut self) {
        self.contacts.begin();
    }

    pub fn begin_directory_refresh(&mut self) {
        self.directory.begin();
    }

    pub fn replace_contacts(&mut self, response: &ContactsResponse) -> usize {
        self.contacts.replace(
            response
                .contacts
                .iter()
                .map(|entry| (&entry.user, entry.role)),
        )
    }

    pub fn replace_directory(&mut self, response: &DirectoryResponse) -> usize {
        self.directory
            .replace(response.users.iter().map(|user| (user, None)))
    }

    pub fn fail_contacts(&mut self, error: OperationError) {
        self.contacts.fail(error);
    }

    pub fn fail_directory(&mut self, error: OperationError) {
        self.directory.fail(error);
    }

    /// Maps any id a user is known by onto one canonical identity. The
    /// contact list's identity wins; the directory links ids the contact
    /// entry itself does not carry. Unknown ids are returned unchanged.
    pub fn canonical_identity(&self, identity: &UserId) -> UserId {
        if let Some(canonical) = self.contacts.lookup(identity) {
            return canonical;
        }
        let Some(canonical) = self.directory.lookup(identity) else {
            return identity.clone();
        };
        let linked = self
            .directory
            .ids_for(&canonical)
            .find_map(|id| self.contacts.lookup(id));
        linked.unwrap_or(canonical)
    }

    /// Looks an identity up in the contact list first, then the directory.
    pub fn resolve(&self, identity: &UserId) -> Option<Contact> {
        let identity = self.canonical_identity(identity);
        self.contacts
            .find(&identity)
            .or_else(|| self.directory.find(&identity))
            .cloned()
    }

    pub fn contact(&self, identity: &UserId) -> Option<&Contact> {
        self.contacts.find(identity)
    }

    pub(crate) fn contact_mut(&mut self, identity: &UserId) -> Option<&mut Contact> {
        self.contacts
            .entries
            .iter_mut()
            .find(|entry| &entry.identity == identity)
    }

    /// Case-insensitive substring match on display name and handle. An empty
    /// query returns the whole directory.
    pub fn search(&self, query: &str) -> Vec<Contact> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.directory.entries.clone();
        }
        self.directory
            .entries
            .iter()
            .filter(|user| {
                user.display_name.to_lowercase().contains(&needle)
                    || user
                        .handle
                        .as_deref()
                        .is_some_and(|handle| handle.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/contacts_tests.rs"]
mod tests;
