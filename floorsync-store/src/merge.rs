//! Merge/selector layer: derives what consumers render.
//!
//! Pure functions over borrowed layer state. The view for an entity is its
//! authoritative payload with every still-pending patch folded over it in
//! creation order, so a later patch wins on a shared field and patches on
//! disjoint fields compose.
//!
//! A newer authoritative version does not displace a pending patch. The
//! overlay only goes away on confirm, reject or expiry.

use std::collections::BTreeSet;

use crate::types::{AuthoritativeRecord, PendingMutation, ViewRecord};

/// Compute the view for one entity.
///
/// Returns `None` when there is no authoritative record yet, even if
/// mutations reference the entity. Non-pending mutations in `mutations`
/// are ignored.
pub fn merge_view<'a, I>(record: Option<&AuthoritativeRecord>, mutations: I) -> Option<ViewRecord>
where
    I: IntoIterator<Item = &'a PendingMutation>,
{
    let record = record?;

    let mut active: Vec<&PendingMutation> =
        mutations.into_iter().filter(|m| m.is_pending()).collect();
    active.sort_by_key(|m| m.order_key());

    let mut data = record.payload.clone();
    let mut pending_fields = BTreeSet::new();
    for mutation in &active {
        for (field, value) in mutation.patch() {
            data.insert(field.clone(), value.clone());
            pending_fields.insert(field.clone());
        }
    }

    Some(ViewRecord {
        entity_id: record.entity_id.clone(),
        data,
        server_version: record.server_version,
        has_pending_changes: !active.is_empty(),
        pending_field_set: pending_fields.into_iter().collect(),
    })
}
