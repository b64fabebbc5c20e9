//! Events and the process-wide active event.

use crate::db::{format_ts, is_constraint_violation, parse_ts, Store, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{Event, EventId};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

const EVENT_SELECT_SQL: &str =
    "SELECT id, name, start_time, description, is_active, created_at, updated_at FROM events";

struct EventRow {
    id: String,
    name: String,
    start_time: String,
    description: Option<String>,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            start_time: row.get(2)?,
            description: row.get(3)?,
            is_active: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<Event, StoreError> {
        Ok(Event {
            start_time: parse_ts(&self.start_time, "start_time")?,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
            id: EventId::from(self.id),
            name: self.name,
            description: self.description,
            is_active: self.is_active,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Caller-chosen id; a UUID is minted when absent.
    pub id: Option<EventId>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub description: Option<String>,
}

/// Fields to change on an existing event; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct EventUpdate {
    pub name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

impl Store {
    pub async fn create_event(&self, new: NewEvent) -> Result<Event, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::InvalidInput("event name must not be empty".into()));
        }
        let id = new
            .id
            .unwrap_or_else(|| EventId::new(uuid::Uuid::new_v4().to_string()));
        let key = id.to_string();
        let now = format_ts(&Utc::now());
        let start = format_ts(&new.start_time);
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO events (id, name, start_time, description, is_active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                    params![key, new.name, start, new.description, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from);

        match result {
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "event",
                id: id.to_string(),
            }),
            Err(e) => Err(e),
            Ok(()) => {
                tracing::info!(event = %id, "event created");
                self.get_event(&id).await?.ok_or_else(|| StoreError::NotFound {
                    kind: "event",
                    id: id.to_string(),
                })
            }
        }
    }

    pub async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let key = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("{EVENT_SELECT_SQL} WHERE id = ?1"),
                        params![key],
                        EventRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(EventRow::into_event).transpose()
    }

    /// All events, most recent start first.
    pub async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{EVENT_SELECT_SQL} ORDER BY start_time DESC, rowid"))?;
                let rows = stmt
                    .query_map([], EventRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Edit an event. A new start time applies to sightings recorded from now
    /// on; existing attendance keeps the status it was recorded with.
    pub async fn update_event(&self, id: &EventId, update: EventUpdate) -> Result<Event, StoreError> {
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(StoreError::InvalidInput("event name must not be empty".into()));
        }
        let key = id.to_string();
        let now = format_ts(&Utc::now());
        let start = update.start_time.as_ref().map(format_ts);
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE events SET
                        name = COALESCE(?1, name),
                        start_time = COALESCE(?2, start_time),
                        description = COALESCE(?3, description),
                        updated_at = ?4
                     WHERE id = ?5",
                    params![update.name, start, update.description, now, key],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "event",
                id: id.to_string(),
            });
        }
        tracing::info!(event = %id, "event updated");
        self.get_event(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "event",
            id: id.to_string(),
        })
    }

    /// Delete an event. Its attendance records are kept; if it was active,
    /// no event is active afterwards.
    pub async fn delete_event(&self, id: &EventId) -> Result<bool, StoreError> {
        let key = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM events WHERE id = ?1", params![key])?))
            .await?;
        if deleted > 0 {
            tracing::info!(event = %id, "event deleted");
        }
        Ok(deleted > 0)
    }

    /// Make `id` the single active event, deactivating any other.
    pub async fn set_active_event(&self, id: &EventId) -> Result<Event, StoreError> {
        let key = id.to_string();
        let now = format_ts(&Utc::now());
        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "UPDATE events SET is_active = 0, updated_at = ?1 WHERE is_active = 1 AND id <> ?2",
                    params![now, key],
                )?;
                let updated = tx.execute(
                    "UPDATE events SET is_active = 1, updated_at = ?1 WHERE id = ?2",
                    params![now, key],
                )?;
                if updated == 0 {
                    // Leave the previous active event untouched.
                    tx.rollback()?;
                    return Ok(false);
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if !found {
            return Err(StoreError::NotFound {
                kind: "event",
                id: id.to_string(),
            });
        }
        tracing::info!(event = %id, "active event switched");
        self.get_event(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "event",
            id: id.to_string(),
        })
    }

    pub async fn clear_active_event(&self) -> Result<(), StoreError> {
        let now = format_ts(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE events SET is_active = 0, updated_at = ?1 WHERE is_active = 1",
                    params![now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn active_event(&self) -> Result<Option<Event>, StoreError> {
        let row = self
            .conn
            .call(|conn| {
                Ok(conn
                    .query_row(
                        &format!("{EVENT_SELECT_SQL} WHERE is_active = 1"),
                        [],
                        EventRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(EventRow::into_event).transpose()
    }
}
