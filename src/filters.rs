use std::sync::Arc;

use crate::collection::Fields;
use crate::diff::FieldCmp;

/// Per-item inclusion predicate applied while keying a collection.
pub type KeyFilter = Arc<dyn Fn(&Fields) -> bool + Send + Sync>;

/// Everything a named filter policy decides about one audit: which fields to
/// compare, which fields form the key, provider-side fetch filters, per-item
/// key filters, and the field comparison policy.
///
/// One concrete value per registered policy; the default accepts every record
/// and compares every collection field by identity.
#[derive(Default, Clone)]
pub struct DiffFilter {
    /// Comparison field override; unset means the origin collection's fields.
    pub fields: Option<Vec<String>>,

    /// Key-field override; unset means the origin collection's key fields.
    pub key_fields: Option<Vec<String>>,

    /// Provider-specific fetch filter for the origin source.
    pub origin_fetch: Option<String>,

    /// Provider-specific fetch filter for the target source.
    pub target_fetch: Option<String>,

    /// Inclusion predicate for origin items during keying.
    pub origin_key: Option<KeyFilter>,

    /// Inclusion predicate for target items during keying.
    pub target_key: Option<KeyFilter>,

    /// Field comparison normalizers for the diff.
    pub fields_cmp: FieldCmp,
}

impl std::fmt::Debug for DiffFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffFilter")
            .field("fields", &self.fields)
            .field("key_fields", &self.key_fields)
            .field("origin_fetch", &self.origin_fetch)
            .field("target_fetch", &self.target_fetch)
            .field("origin_key", &self.origin_key.is_some())
            .field("target_key", &self.target_key.is_some())
            .field("fields_cmp", &self.fields_cmp.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DiffFilter {
    pub fn origin_key_filter(&self) -> Option<&dyn Fn(&Fields) -> bool> {
        match &self.origin_key {
            Some(f) => Some(f.as_ref()),
            None => None,
        }
    }

    pub fn target_key_filter(&self) -> Option<&dyn Fn(&Fields) -> bool> {
        match &self.target_key {
            Some(f) => Some(f.as_ref()),
            None => None,
        }
    }
}
