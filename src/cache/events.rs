//! Mutation events.
//!
//! A `MutationEvent` is built once per signalled mutation response, consumed
//! by the store patch step, then broadcast to every matching listener.

use std::fmt;

use crate::domain::entities::{Collection, Entity, EntityId};

/// Monotonic epoch for ordering dispatches and patches within a session.
pub type Epoch = u64;

/// Discriminant of a [`MutationEvent`], as carried by the signal type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
        }
    }

    /// Case-insensitive parse of a signal type value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Some(Self::Created),
            "UPDATED" => Some(Self::Updated),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation on a server-owned collection.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    /// A new entity was created; carries enough of it to render page 1.
    Created {
        collection: Collection,
        entity: Entity,
    },
    /// An entity changed. Without a snapshot the store cannot patch in place.
    Updated {
        collection: Collection,
        id: EntityId,
        snapshot: Option<Entity>,
    },
    /// An entity was removed.
    Deleted { collection: Collection, id: EntityId },
}

impl MutationEvent {
    pub fn created(collection: Collection, entity: Entity) -> Self {
        Self::Created { collection, entity }
    }

    pub fn updated(collection: Collection, entity: Entity) -> Self {
        Self::Updated {
            collection,
            id: entity.id.clone(),
            snapshot: Some(entity),
        }
    }

    pub fn deleted(collection: Collection, id: impl Into<EntityId>) -> Self {
        Self::Deleted {
            collection,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Created,
            Self::Updated { .. } => EventKind::Updated,
            Self::Deleted { .. } => EventKind::Deleted,
        }
    }

    /// The collection whose cached pages this event affects.
    pub fn collection(&self) -> &Collection {
        match self {
            Self::Created { collection, .. }
            | Self::Updated { collection, .. }
            | Self::Deleted { collection, .. } => collection,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Created { entity, .. } => &entity.id,
            Self::Updated { id, .. } | Self::Deleted { id, .. } => id,
        }
    }
}
