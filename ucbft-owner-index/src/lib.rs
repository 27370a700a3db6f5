//! Owner Indexer (spec.md §2 C9, §4.4). Maintains `owner_id -> [unit_id]`
//! synchronously with committed state (spec.md §4.1.4 step 8 "Update
//! owner-indexer synchronously"), preserving insertion order. Reads from
//! RPC handlers race with main-loop writes, so the map sits behind a
//! readers-writer lock rather than the single-writer atomics used for
//! `LUC`/`LTR` (spec.md §5 "Shared resource policy").

use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct UnitId(pub Vec<u8>);

/// Pubkey-hash owner identity; only P2PKH predicates contribute an owner
/// key (spec.md §4.4 "Only P2PKH predicates contribute an owner key").
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct OwnerId(pub Vec<u8>);

#[derive(Clone, Debug)]
pub enum OwnerPredicate {
    P2pkh(OwnerId),
    Other,
}

/// Capability the transaction system presents for one already-executed
/// block (Design Notes §9 "capability records"): a unit's current and
/// (if it predates this round) previous owner predicate.
pub trait UnitLogReader: Send + Sync {
    fn existed_before(&self, unit: &UnitId) -> bool;

    fn previous_predicate(&self, unit: &UnitId) -> OwnerPredicate;

    fn current_predicate(&self, unit: &UnitId) -> OwnerPredicate;
}

#[derive(Default)]
pub struct OwnerIndexer {
    index: RwLock<BTreeMap<OwnerId, Vec<UnitId>>>,
}

impl OwnerIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `IndexBlock` (spec.md §4.4): for each touched unit, drop the
    /// previous owner's entry (if the unit existed before this round and
    /// was P2PKH-owned) then append under the current owner (if
    /// P2PKH-owned), preserving insertion order.
    pub fn index_block(&self, touched_units: &[UnitId], reader: &dyn UnitLogReader) {
        let mut index = self.index.write();
        for unit in touched_units {
            if reader.existed_before(unit) {
                if let OwnerPredicate::P2pkh(prev_owner) = reader.previous_predicate(unit) {
                    if let Some(units) = index.get_mut(&prev_owner) {
                        units.retain(|u| u != unit);
                        if units.is_empty() {
                            index.remove(&prev_owner);
                        }
                    }
                }
            }
            if let OwnerPredicate::P2pkh(owner) = reader.current_predicate(unit) {
                let units = index.entry(owner).or_default();
                if !units.contains(unit) {
                    units.push(unit.clone());
                }
            }
        }
    }

    /// Read path used by the `state.getUnitsByOwnerID` RPC (spec.md §6).
    pub fn units_by_owner(&self, owner: &OwnerId) -> Vec<UnitId> {
        self.index.read().get(owner).cloned().unwrap_or_default()
    }
}
