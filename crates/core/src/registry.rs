//! Texture registry
//!
//! Owns every [`TextureRecord`] in a generational slot map and indexes them
//! by `(TextureId, ListKind)`. Handles stay cheap to copy and hash; once a
//! record is removed its handle never resolves again, even if the slot is
//! reused.

use std::collections::BTreeMap;
use std::time::Duration;

use slotmap::{new_key_type, Key, KeyData, SlotMap};
use texstream_cache::TextureId;

use crate::error::{TextureError, TextureResult};
use crate::texture::{ImageRequest, ListKind, TextureKey, TextureRecord};

new_key_type! {
    /// Generational handle to a texture record
    pub struct TextureHandle;
}

impl TextureHandle {
    /// Encode the handle for a fetch request's owner field
    pub fn to_owner(self) -> u64 {
        self.data().as_ffi()
    }

    /// Decode a handle from a fetch request's owner field
    pub fn from_owner(owner: u64) -> Self {
        KeyData::from_ffi(owner).into()
    }
}

/// Outcome of [`TextureRegistry::remove`]
#[derive(Debug)]
pub enum Removal {
    /// The record is gone
    Removed(Box<TextureRecord>),
    /// The record is still referenced; it goes once the last reference does
    Deferred,
    /// The handle did not resolve
    Stale,
}

/// Registry of live texture records
#[derive(Debug, Default)]
pub struct TextureRegistry {
    records: SlotMap<TextureHandle, TextureRecord>,
    index: BTreeMap<TextureKey, TextureHandle>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one list kind of an identity
    pub fn find(&self, id: TextureId, kind: ListKind) -> Option<TextureHandle> {
        self.index.get(&(id, kind)).copied()
    }

    /// Every list kind of an identity, `Standard` first
    pub fn find_all(&self, id: TextureId) -> Vec<TextureHandle> {
        self.index
            .range((id, ListKind::Standard)..=(id, ListKind::Scale))
            .map(|(_, handle)| *handle)
            .collect()
    }

    /// Return the record for `request`, allocating it if needed
    ///
    /// The flag is true when a new record was created. An existing record is
    /// returned unchanged.
    pub fn create(&mut self, request: &ImageRequest, now: Duration) -> TextureResult<(TextureHandle, bool)> {
        if !request.id.is_valid() {
            return Err(TextureError::InvalidIdentity(request.id));
        }
        if let Some(handle) = self.find(request.id, request.list_kind) {
            return Ok((handle, false));
        }
        let handle = self.records.insert(TextureRecord::new(request, now));
        self.index.insert(request.key(), handle);
        Ok((handle, true))
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&TextureRecord> {
        self.records.get(handle)
    }

    pub fn get_mut(&mut self, handle: TextureHandle) -> Option<&mut TextureRecord> {
        self.records.get_mut(handle)
    }

    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.records.contains_key(handle)
    }

    /// Remove a record, or defer removal while it is referenced
    pub fn remove(&mut self, handle: TextureHandle) -> Removal {
        let Some(record) = self.records.get_mut(handle) else {
            return Removal::Stale;
        };
        if record.ref_count() > 0 {
            record.removal_pending = true;
            return Removal::Deferred;
        }
        match self.take(handle) {
            Some(record) => Removal::Removed(Box::new(record)),
            None => Removal::Stale,
        }
    }

    fn take(&mut self, handle: TextureHandle) -> Option<TextureRecord> {
        let record = self.records.remove(handle)?;
        self.index.remove(&record.key());
        Some(record)
    }

    /// Finish a deferred removal once nothing references the record
    fn settle(&mut self, handle: TextureHandle) -> Option<TextureRecord> {
        let record = self.records.get(handle)?;
        if record.removal_pending && record.ref_count() == 0 {
            self.take(handle)
        } else {
            None
        }
    }

    /// Add a UI reference
    pub fn retain_ui(&mut self, handle: TextureHandle) -> TextureResult<()> {
        let record = self.records.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        record.ui_refs += 1;
        Ok(())
    }

    /// Drop a UI reference; returns the record if that completed a deferred removal
    pub fn release_ui(&mut self, handle: TextureHandle) -> TextureResult<Option<TextureRecord>> {
        let record = self.records.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        record.ui_refs = record.ui_refs.saturating_sub(1);
        Ok(self.settle(handle))
    }

    /// Pin a record into the preload set
    pub fn pin(&mut self, handle: TextureHandle) -> TextureResult<()> {
        let record = self.records.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        record.preload_pins += 1;
        Ok(())
    }

    pub fn unpin(&mut self, handle: TextureHandle) -> TextureResult<Option<TextureRecord>> {
        let record = self.records.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        record.preload_pins = record.preload_pins.saturating_sub(1);
        Ok(self.settle(handle))
    }

    pub fn add_callback_ref(&mut self, handle: TextureHandle) -> TextureResult<()> {
        let record = self.records.get_mut(handle).ok_or(TextureError::StaleHandle(handle))?;
        record.callback_refs += 1;
        Ok(())
    }

    /// Drop `count` callback references at once
    pub fn release_callback_refs(&mut self, handle: TextureHandle, count: u32) -> Option<TextureRecord> {
        let record = self.records.get_mut(handle)?;
        record.callback_refs = record.callback_refs.saturating_sub(count);
        self.settle(handle)
    }

    /// Handles of live records in slot order
    pub fn handles(&self) -> Vec<TextureHandle> {
        self.records.keys().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TextureHandle, &TextureRecord)> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TextureHandle, &mut TextureRecord)> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) -> Vec<TextureRecord> {
        self.index.clear();
        self.records.drain().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: TextureId) -> ImageRequest {
        ImageRequest::new(id)
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut registry = TextureRegistry::new();
        let id = TextureId::new_random();

        let (first, created) = registry.create(&request(id), Duration::ZERO).unwrap();
        assert!(created);
        registry.get_mut(first).unwrap().desired_discard = 2;

        let (second, created) = registry.create(&request(id), Duration::from_secs(5)).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(registry.get(second).unwrap().desired_discard, 2);
        assert_eq!(registry.get(second).unwrap().last_referenced, Duration::ZERO);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(id, ListKind::Standard), Some(first));
    }

    #[test]
    fn test_nil_identity_rejected() {
        let mut registry = TextureRegistry::new();
        let result = registry.create(&request(TextureId::nil()), Duration::ZERO);
        assert!(matches!(result, Err(TextureError::InvalidIdentity(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_all_orders_list_kinds() {
        let mut registry = TextureRegistry::new();
        let id = TextureId::new_random();
        let (scaled, _) = registry
            .create(&request(id).list_kind(ListKind::Scale), Duration::ZERO)
            .unwrap();
        let (standard, _) = registry.create(&request(id), Duration::ZERO).unwrap();
        registry.create(&request(TextureId::new_random()), Duration::ZERO).unwrap();

        assert_eq!(registry.find_all(id), vec![standard, scaled]);
        assert!(registry.find_all(TextureId::new_random()).is_empty());
    }

    #[test]
    fn test_removed_handle_never_resolves() {
        let mut registry = TextureRegistry::new();
        let id = TextureId::new_random();
        let (handle, _) = registry.create(&request(id), Duration::ZERO).unwrap();

        assert!(matches!(registry.remove(handle), Removal::Removed(_)));
        assert!(registry.get(handle).is_none());
        assert!(registry.find(id, ListKind::Standard).is_none());
        assert!(matches!(registry.remove(handle), Removal::Stale));

        // slot reuse must not revive the old handle
        let (reused, _) = registry.create(&request(id), Duration::ZERO).unwrap();
        assert_ne!(reused, handle);
        assert!(registry.get(handle).is_none());
    }

    #[test]
    fn test_removal_deferred_while_referenced() {
        let mut registry = TextureRegistry::new();
        let (handle, _) = registry.create(&request(TextureId::new_random()), Duration::ZERO).unwrap();
        registry.retain_ui(handle).unwrap();
        registry.pin(handle).unwrap();

        assert!(matches!(registry.remove(handle), Removal::Deferred));
        assert!(registry.get(handle).unwrap().removal_pending);

        assert!(registry.release_ui(handle).unwrap().is_none());
        let removed = registry.unpin(handle).unwrap();
        assert!(removed.is_some());
        assert!(!registry.contains(handle));
        assert!(matches!(registry.release_ui(handle), Err(TextureError::StaleHandle(_))));
    }

    #[test]
    fn test_callback_refs_settle_removal() {
        let mut registry = TextureRegistry::new();
        let (handle, _) = registry.create(&request(TextureId::new_random()), Duration::ZERO).unwrap();
        registry.add_callback_ref(handle).unwrap();
        registry.add_callback_ref(handle).unwrap();
        assert!(matches!(registry.remove(handle), Removal::Deferred));

        assert!(registry.release_callback_refs(handle, 1).is_none());
        assert!(registry.release_callback_refs(handle, 1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_owner_round_trip() {
        let mut registry = TextureRegistry::new();
        let (handle, _) = registry.create(&request(TextureId::new_random()), Duration::ZERO).unwrap();
        assert_eq!(TextureHandle::from_owner(handle.to_owner()), handle);
    }

    #[test]
    fn test_iteration_is_slot_ordered() {
        let mut registry = TextureRegistry::new();
        let created: Vec<TextureHandle> = (0..5)
            .map(|_| registry.create(&request(TextureId::new_random()), Duration::ZERO).unwrap().0)
            .collect();
        assert_eq!(registry.handles(), created);
        assert_eq!(registry.iter().count(), 5);

        let removed = registry.clear();
        assert_eq!(removed.len(), 5);
        assert!(registry.is_empty());
    }
}
