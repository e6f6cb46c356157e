//! Resource lock table.
//!
//! Maps resource names (object paths or package names) to the endpoint that
//! owns them. Two kinds of lock share the table:
//!
//! - **explicit** locks, requested by a user and recorded in the ledger
//! - **temporary** locks, taken around a single admission to serialize it
//!
//! Lock and unlock are all-or-nothing: either every resource changes or none
//! does, and the conflicting owners are reported back.

use bitflags::bitflags;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use ensemble_core::EndpointId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u8 {
        /// User-requested lock, recorded in the ledger
        const EXPLICIT = 1;
        /// Held only for the duration of one admission
        const TEMPORARY = 1 << 1;
        /// Ignore the current owner
        const FORCE = 1 << 2;
    }
}

/// One held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub resource_name: String,
    pub owner: EndpointId,
    pub explicit: bool,
    pub temporary: bool,
}

/// Resources held by other endpoints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} resource(s) locked by another endpoint", failed.len())]
pub struct LockConflict {
    /// Resource → current owner
    pub failed: BTreeMap<String, EndpointId>,
}

#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<String, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every resource in `names` for `owner`.
    ///
    /// Re-locking an owned resource upgrades it (temporary → held,
    /// implicit → explicit), never downgrades. Returns the resources whose
    /// non-temporary lock state changed.
    pub fn lock(
        &mut self,
        names: &[String],
        owner: EndpointId,
        flags: LockFlags,
    ) -> Result<Vec<String>, LockConflict> {
        if !flags.contains(LockFlags::FORCE) {
            self.check_owner(names, owner)?;
        }

        let explicit = flags.contains(LockFlags::EXPLICIT);
        let temporary = flags.contains(LockFlags::TEMPORARY);
        let mut changed = Vec::new();

        for name in names {
            match self.entries.get_mut(name) {
                Some(entry) if entry.owner == owner => {
                    let was_held = !entry.temporary;
                    entry.explicit |= explicit;
                    entry.temporary &= temporary;
                    if !was_held && !entry.temporary {
                        changed.push(name.clone());
                    }
                }
                Some(entry) => {
                    // Forced takeover
                    entry.owner = owner;
                    entry.explicit = explicit;
                    entry.temporary = temporary;
                    if !temporary {
                        changed.push(name.clone());
                    }
                }
                None => {
                    self.entries.insert(
                        name.clone(),
                        LockEntry {
                            resource_name: name.clone(),
                            owner,
                            explicit,
                            temporary,
                        },
                    );
                    if !temporary {
                        changed.push(name.clone());
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Release every resource in `names` held by `owner`.
    ///
    /// Without `FORCE`, an implicit unlock leaves explicit locks in place and
    /// a temporary unlock leaves held locks in place. Returns the resources
    /// whose non-temporary lock was released.
    pub fn unlock(
        &mut self,
        names: &[String],
        owner: EndpointId,
        flags: LockFlags,
    ) -> Result<Vec<String>, LockConflict> {
        let force = flags.contains(LockFlags::FORCE);
        if !force {
            self.check_owner(names, owner)?;
        }

        let explicit = flags.contains(LockFlags::EXPLICIT);
        let temporary = flags.contains(LockFlags::TEMPORARY);
        let mut changed = Vec::new();

        for name in names {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !force && ((entry.explicit && !explicit) || (!entry.temporary && temporary)) {
                continue;
            }
            if !entry.temporary {
                changed.push(name.clone());
            }
            self.entries.remove(name);
        }
        Ok(changed)
    }

    /// Release everything `owner` holds, e.g. on disconnect.
    pub fn release_all(&mut self, owner: EndpointId) -> Vec<String> {
        let mut released: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.owner == owner && !e.temporary)
            .map(|e| e.resource_name.clone())
            .collect();
        self.entries.retain(|_, e| e.owner != owner);
        released.sort();
        released
    }

    fn check_owner(&self, names: &[String], owner: EndpointId) -> Result<(), LockConflict> {
        let failed: BTreeMap<String, EndpointId> = names
            .iter()
            .filter_map(|name| {
                self.entries
                    .get(name)
                    .filter(|e| e.owner != owner)
                    .map(|e| (name.clone(), e.owner))
            })
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(LockConflict { failed })
        }
    }

    pub fn owner(&self, name: &str) -> Option<EndpointId> {
        self.entries.get(name).map(|e| e.owner)
    }

    pub fn entry(&self, name: &str) -> Option<&LockEntry> {
        self.entries.get(name)
    }

    pub fn is_locked_by(&self, name: &str, owner: EndpointId) -> bool {
        self.owner(name) == Some(owner)
    }

    /// Non-temporary locks, sorted by resource name.
    pub fn locked_resources(&self) -> Vec<(String, EndpointId)> {
        let mut locks: Vec<(String, EndpointId)> = self
            .entries
            .values()
            .filter(|e| !e.temporary)
            .map(|e| (e.resource_name.clone(), e.owner))
            .collect();
        locks.sort();
        locks
    }

    pub fn entries(&self) -> impl Iterator<Item = &LockEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
