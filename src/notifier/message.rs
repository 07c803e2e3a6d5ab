//! Trigger event -> published message

use super::error::NotifyError;
use crate::event::{EventMessage, StorageObjectData};

/// Build the message for one storage notification.
///
/// `bucket`, `name`, `generation`, `timeCreated` and the event id are
/// required; empty values count as missing. `size` becomes an integer or
/// `null`.
pub fn build_message(
    event_id: Option<&str>,
    data: &StorageObjectData,
) -> Result<EventMessage, NotifyError> {
    let event_id = non_empty(event_id).ok_or(NotifyError::MissingData("event id"))?;
    let bucket = non_empty(data.bucket.as_deref()).ok_or(NotifyError::MissingData("bucket"))?;
    let name = non_empty(data.name.as_deref()).ok_or(NotifyError::MissingData("name"))?;
    let generation = data
        .generation
        .as_ref()
        .filter(|g| !g.is_blank())
        .ok_or(NotifyError::MissingData("generation"))?;
    let time_created = non_empty(data.time_created.as_deref())
        .ok_or(NotifyError::MissingData("timeCreated"))?;

    let size = match &data.size {
        Some(size) => size.coerce()?,
        None => None,
    };

    Ok(EventMessage {
        event_id: event_id.to_string(),
        bucket: bucket.to_string(),
        object: name.to_string(),
        generation: generation.clone(),
        size,
        content_type: data.content_type.clone(),
        time_created: time_created.to_string(),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
