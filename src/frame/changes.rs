//! Which fields of a frame differ from the previous version.

use rustc_hash::FxHashSet;

use super::field::FrameField;

/// Set of changed fields: a bitmask over [`FrameField`] plus the raw keys
/// of changed extension fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameChanges {
    fields: u32,
    extra_keys: FxHashSet<String>,
}

impl FrameChanges {
    /// Nothing changed.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Every known field changed (used when the frame history resets).
    #[must_use]
    pub fn all_known() -> Self {
        let mut changes = Self::none();
        for field in FrameField::ALL {
            changes.insert(field);
        }
        changes
    }

    /// Mark a known field changed.
    pub fn insert(&mut self, field: FrameField) {
        self.fields |= field.bit();
    }

    /// Mark a wire key changed, resolving it against the field registry.
    pub fn insert_key(&mut self, key: &str) {
        match FrameField::from_key(key) {
            Some(field) => self.insert(field),
            None => {
                let _ = self.extra_keys.insert(key.to_owned());
            }
        }
    }

    /// Whether `field` changed.
    #[must_use]
    pub fn has_changed(&self, field: FrameField) -> bool {
        self.fields & field.bit() != 0
    }

    /// Whether the field stored under `key` changed.
    #[must_use]
    pub fn has_changed_key(&self, key: &str) -> bool {
        FrameField::from_key(key).map_or_else(
            || self.extra_keys.contains(key),
            |field| self.has_changed(field),
        )
    }

    /// True iff the change set is non-empty.
    #[must_use]
    pub fn has_anything_changed(&self) -> bool {
        self.fields != 0 || !self.extra_keys.is_empty()
    }

    /// Known fields that changed, in registry order.
    pub fn fields(&self) -> impl Iterator<Item = FrameField> + '_ {
        FrameField::ALL
            .into_iter()
            .filter(|field| self.has_changed(*field))
    }

    /// Extension keys that changed.
    pub fn extra_keys(&self) -> impl Iterator<Item = &str> {
        self.extra_keys.iter().map(String::as_str)
    }

    /// Add every change of `other` to this set.
    pub fn merge_from(&mut self, other: &Self) {
        self.fields |= other.fields;
        self.extra_keys.extend(other.extra_keys.iter().cloned());
    }

    /// Set union of two change sets.
    #[must_use]
    pub fn union(mut self, other: &Self) -> Self {
        self.merge_from(other);
        self
    }

    /// Forget all changes.
    pub fn clear(&mut self) {
        self.fields = 0;
        self.extra_keys.clear();
    }
}

impl FromIterator<FrameField> for FrameChanges {
    fn from_iter<I: IntoIterator<Item = FrameField>>(iter: I) -> Self {
        let mut changes = Self::none();
        for field in iter {
            changes.insert(field);
        }
        changes
    }
}
