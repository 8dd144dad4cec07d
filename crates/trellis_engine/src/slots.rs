//! Handle slot table
//!
//! Every heap value handed to the host occupies one slot. A slot either pins
//! its value (`Strong`) or only observes it through a script `WeakRef`
//! (`Weak`); releasing a slot bumps its generation so older handles go stale.

use crate::error::{EngineError, EngineResult};
use crate::value::{CellId, ValueKind};
use rquickjs::{Persistent, Value};

pub(crate) type Saved = Persistent<Value<'static>>;

#[derive(Clone)]
pub(crate) enum Entry {
    /// Keeps the value alive.
    Strong(Saved),
    /// A `WeakRef` wrapping the value.
    Weak(Saved),
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
    kind: ValueKind,
    roots: u32,
}

#[derive(Default)]
pub(crate) struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Slots {
    pub(crate) fn insert(&mut self, entry: Entry, kind: ValueKind) -> CellId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            slot.kind = kind;
            slot.roots = 0;
            return CellId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
            kind,
            roots: 0,
        });
        CellId::new(index, 0)
    }

    fn slot(&self, id: CellId) -> EngineResult<&Slot> {
        match self.slots.get(id.index() as usize) {
            Some(slot) if slot.generation == id.generation() && slot.entry.is_some() => Ok(slot),
            _ => Err(EngineError::InvalidHandle),
        }
    }

    fn slot_mut(&mut self, id: CellId) -> EngineResult<&mut Slot> {
        match self.slots.get_mut(id.index() as usize) {
            Some(slot) if slot.generation == id.generation() && slot.entry.is_some() => Ok(slot),
            _ => Err(EngineError::InvalidHandle),
        }
    }

    pub(crate) fn kind(&self, id: CellId) -> EngineResult<ValueKind> {
        Ok(self.slot(id)?.kind)
    }

    pub(crate) fn entry(&self, id: CellId) -> EngineResult<Entry> {
        self.slot(id)?
            .entry
            .clone()
            .ok_or(EngineError::InvalidHandle)
    }

    pub(crate) fn roots(&self, id: CellId) -> EngineResult<u32> {
        Ok(self.slot(id)?.roots)
    }

    /// Add a root. Returns whether the slot is currently weak.
    pub(crate) fn root(&mut self, id: CellId) -> EngineResult<bool> {
        let slot = self.slot_mut(id)?;
        slot.roots += 1;
        Ok(matches!(slot.entry, Some(Entry::Weak(_))))
    }

    /// Drop a root. Saturates at zero.
    pub(crate) fn unroot(&mut self, id: CellId) -> EngineResult<()> {
        let slot = self.slot_mut(id)?;
        slot.roots = slot.roots.saturating_sub(1);
        Ok(())
    }

    /// Swap the entry, returning the previous one so the caller can drop it
    /// outside any borrow.
    pub(crate) fn replace(&mut self, id: CellId, entry: Entry) -> Option<Entry> {
        self.slot_mut(id).ok().and_then(|slot| slot.entry.replace(entry))
    }

    pub(crate) fn release(&mut self, id: CellId) -> Option<Entry> {
        let slot = self.slot_mut(id).ok()?;
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.roots = 0;
        self.free.push(id.index());
        entry
    }

    /// Strong slots with no roots, in slot order.
    pub(crate) fn unrooted_strong(&self) -> Vec<(CellId, ValueKind, Saved)> {
        self.live()
            .filter(|(_, slot)| slot.roots == 0)
            .filter_map(|(id, slot)| match &slot.entry {
                Some(Entry::Strong(saved)) => Some((id, slot.kind, saved.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn weak(&self) -> Vec<(CellId, Saved)> {
        self.live()
            .filter_map(|(id, slot)| match &slot.entry {
                Some(Entry::Weak(saved)) => Some((id, saved.clone())),
                _ => None,
            })
            .collect()
    }

    fn live(&self) -> impl Iterator<Item = (CellId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| (CellId::new(index as u32, slot.generation), slot))
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live().count()
    }

    pub(crate) fn rooted_count(&self) -> usize {
        self.live().filter(|(_, slot)| slot.roots > 0).count()
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.live()
            .filter(|(_, slot)| matches!(slot.entry, Some(Entry::Weak(_))))
            .count()
    }
}
