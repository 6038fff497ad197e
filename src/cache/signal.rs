//! Mutation signal codec.
//!
//! The data service stamps every successful mutating response with three
//! headers naming the collection, the kind of mutation and a JSON payload.
//! A response without the marker header carries no signal.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::entities::{Collection, Entity, EntityId};

use super::events::{EventKind, MutationEvent};

/// Affected collection, e.g. `posts-notice`.
pub const MARKER_HEADER: &str = "x-revalidated-marker";
/// `CREATED`, `UPDATED` or `DELETED`.
pub const TYPE_HEADER: &str = "x-invalidation-type";
/// JSON payload with at least the entity id.
pub const DATA_HEADER: &str = "x-invalidation-data";

#[derive(Debug, Error)]
pub enum SignalDecodeError {
    #[error("signal header `{0}` is missing")]
    MissingField(&'static str),
    #[error("signal header `{0}` is not valid UTF-8")]
    InvalidHeader(&'static str),
    #[error("unknown invalidation type `{0}`")]
    UnknownType(String),
    #[error("invalid collection marker `{marker}`: {reason}")]
    InvalidCollection { marker: String, reason: String },
    #[error("invalid invalidation payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SignalEncodeError {
    #[error("failed to serialize invalidation payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("value for signal header `{0}` is not a valid header value")]
    InvalidValue(&'static str),
}

#[derive(Deserialize)]
struct IdPayload {
    id: EntityId,
}

#[derive(Serialize)]
struct IdRef<'a> {
    id: &'a EntityId,
}

/// Decode the signal carried by a response, if any.
pub fn decode(headers: &HeaderMap) -> Result<Option<MutationEvent>, SignalDecodeError> {
    let Some(marker) = header_str(headers, MARKER_HEADER)? else {
        return Ok(None);
    };

    let collection =
        Collection::parse(marker).map_err(|err| SignalDecodeError::InvalidCollection {
            marker: marker.to_string(),
            reason: err.to_string(),
        })?;

    let kind = header_str(headers, TYPE_HEADER)?
        .ok_or(SignalDecodeError::MissingField(TYPE_HEADER))?;
    let kind =
        EventKind::parse(kind).ok_or_else(|| SignalDecodeError::UnknownType(kind.to_string()))?;

    let data = header_str(headers, DATA_HEADER)?
        .ok_or(SignalDecodeError::MissingField(DATA_HEADER))?;
    let payload: Value = serde_json::from_str(data)?;

    let event = match kind {
        EventKind::Created => {
            let entity: Entity = serde_json::from_value(payload)?;
            MutationEvent::Created { collection, entity }
        }
        EventKind::Updated => {
            let IdPayload { id } = IdPayload::deserialize(&payload)?;
            // Partial payloads still identify the entity; the store falls
            // back to invalidation when there is nothing to patch with.
            let snapshot = serde_json::from_value::<Entity>(payload).ok();
            MutationEvent::Updated {
                collection,
                id,
                snapshot,
            }
        }
        EventKind::Deleted => {
            let IdPayload { id } = IdPayload::deserialize(&payload)?;
            MutationEvent::Deleted { collection, id }
        }
    };

    Ok(Some(event))
}

/// Encode an event as signal headers.
pub fn encode(event: &MutationEvent) -> Result<HeaderMap, SignalEncodeError> {
    let data = match event {
        MutationEvent::Created { entity, .. } => serde_json::to_string(entity)?,
        MutationEvent::Updated {
            snapshot: Some(entity),
            ..
        } => serde_json::to_string(entity)?,
        MutationEvent::Updated { id, .. } | MutationEvent::Deleted { id, .. } => {
            serde_json::to_string(&IdRef { id })?
        }
    };

    let mut headers = HeaderMap::with_capacity(3);
    insert(&mut headers, MARKER_HEADER, &event.collection().to_string())?;
    insert(&mut headers, TYPE_HEADER, event.kind().as_str())?;
    insert(&mut headers, DATA_HEADER, &data)?;
    Ok(headers)
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, SignalDecodeError> {
    // Payload titles are often non-ASCII, so accept any UTF-8 rather than
    // `HeaderValue::to_str`'s visible-ASCII subset.
    headers
        .get(name)
        .map(|value| {
            std::str::from_utf8(value.as_bytes())
                .map_err(|_| SignalDecodeError::InvalidHeader(name))
        })
        .transpose()
}

fn insert(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), SignalEncodeError> {
    let value = HeaderValue::from_bytes(value.as_bytes())
        .map_err(|_| SignalEncodeError::InvalidValue(name))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
