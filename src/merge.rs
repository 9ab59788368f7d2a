//! Merges the Directory's own descriptive metadata into the locally built
//! collection PUT payload. The Directory requires these fields on every PUT,
//! so a missing or incomplete snapshot fails the whole batch.

use std::collections::HashMap;

use tracing::error;

use crate::attributes::CollectionEntity;
use crate::domain::{BbmriEricId, RegistrySnapshot};
use crate::error::SyncError;

pub fn merge_snapshots(
    snapshots: &HashMap<BbmriEricId, RegistrySnapshot>,
    entities: &mut [CollectionEntity],
) -> Result<(), SyncError> {
    for entity in entities.iter_mut() {
        merge_entity(snapshots, entity).inspect_err(|err| {
            error!("problem merging Directory snapshot into PUT payload: {err}");
        })?;
    }
    Ok(())
}

fn merge_entity(
    snapshots: &HashMap<BbmriEricId, RegistrySnapshot>,
    entity: &mut CollectionEntity,
) -> Result<(), SyncError> {
    let snapshot = snapshots
        .get(&entity.id)
        .ok_or_else(|| SyncError::MissingSnapshot(entity.id.to_string()))?;

    entity.name = snapshot.name.clone();
    entity.description = snapshot.description.clone();
    entity.contact = Some(require(&entity.id, "contact", &snapshot.contact_id)?);
    entity.country = Some(require(&entity.id, "country", &snapshot.country_id)?);
    entity.biobank = Some(require(&entity.id, "biobank", &snapshot.biobank_id)?);
    entity.type_ids = snapshot.type_ids.clone();
    entity.data_categories = snapshot.data_category_ids.clone();
    entity.network = snapshot.network_ids.clone();
    Ok(())
}

fn require(
    id: &BbmriEricId,
    field: &'static str,
    value: &Option<String>,
) -> Result<String, SyncError> {
    value.clone().ok_or_else(|| SyncError::IncompleteSnapshot {
        collection: id.to_string(),
        field,
    })
}
