//! Attendance ledger.
//!
//! Append-only. The `(student_id, event_id)` pair is unique at the schema
//! level, and [`Store::record_if_absent`] performs its find-then-insert inside
//! an IMMEDIATE transaction, so concurrent sessions sharing a database file
//! can never produce two records for the same pair.

use crate::db::{format_ts, parse_ts, Store, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceRecord, AttendanceStatus, EventId, RecordId, StudentId};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

const ATTENDANCE_SELECT_SQL: &str =
    "SELECT id, student_id, event_id, confidence, status, recognized_at FROM attendance";

struct AttendanceRow {
    id: String,
    student_id: String,
    event_id: String,
    confidence: f64,
    status: String,
    recognized_at: String,
}

impl AttendanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            event_id: row.get(2)?,
            confidence: row.get(3)?,
            status: row.get(4)?,
            recognized_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let status = self
            .status
            .parse::<AttendanceStatus>()
            .map_err(|e| StoreError::InvalidData(format!("attendance {}: {e}", self.id)))?;
        Ok(AttendanceRecord {
            status,
            // Written from an f32, so narrowing back is exact.
            confidence: self.confidence as f32,
            timestamp: parse_ts(&self.recognized_at, "recognized_at")?,
            id: RecordId::from(self.id),
            student_id: StudentId::from(self.student_id),
            event_id: EventId::from(self.event_id),
        })
    }
}

fn find_row(
    conn: &Connection,
    student_id: &str,
    event_id: &str,
) -> rusqlite::Result<Option<AttendanceRow>> {
    conn.query_row(
        &format!("{ATTENDANCE_SELECT_SQL} WHERE student_id = ?1 AND event_id = ?2"),
        params![student_id, event_id],
        AttendanceRow::from_row,
    )
    .optional()
}

/// A recognition to be recorded.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub student_id: StudentId,
    pub event_id: EventId,
    pub confidence: f32,
    pub recognized_at: DateTime<Utc>,
    pub event_start: DateTime<Utc>,
}

/// Result of [`Store::record_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    /// A new record was written.
    Inserted(AttendanceRecord),
    /// The pair was already recorded; this is the original, unchanged record.
    AlreadyPresent(AttendanceRecord),
}

impl Recorded {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            Self::Inserted(r) | Self::AlreadyPresent(r) => r,
        }
    }

    pub fn into_record(self) -> AttendanceRecord {
        match self {
            Self::Inserted(r) | Self::AlreadyPresent(r) => r,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

impl Store {
    /// Record attendance for `(student_id, event_id)` unless a record exists.
    ///
    /// Status is `late` when `recognized_at` is strictly after `event_start`.
    /// An existing record is returned untouched, and no id is minted for it.
    /// A confidence outside `[0, 1]` is rejected only when a new record would
    /// be written. Not retried on failure.
    pub async fn record_if_absent(&self, req: RecordRequest) -> Result<Recorded, StoreError> {
        if !(0.0..=1.0).contains(&req.confidence) {
            if let Some(existing) = self.find_attendance(&req.student_id, &req.event_id).await? {
                return Ok(Recorded::AlreadyPresent(existing));
            }
            return Err(StoreError::InvalidInput(format!(
                "confidence {} outside [0, 1]",
                req.confidence
            )));
        }
        let status = AttendanceStatus::derive(req.recognized_at, req.event_start);
        let student = req.student_id.to_string();
        let event = req.event_id.to_string();
        let confidence = f64::from(req.confidence);
        let recognized_at = format_ts(&req.recognized_at);

        let (row, inserted) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if let Some(existing) = find_row(&tx, &student, &event)? {
                    tx.commit()?;
                    return Ok((existing, false));
                }

                let id = RecordId::generate();
                let changed = tx.execute(
                    "INSERT INTO attendance (id, student_id, event_id, confidence, status, recognized_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (student_id, event_id) DO NOTHING",
                    params![id.as_str(), student, event, confidence, status.as_str(), recognized_at],
                )?;
                let row = find_row(&tx, &student, &event)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                tx.commit()?;
                Ok((row, changed == 1))
            })
            .await?;

        let record = row.into_record()?;
        if inserted {
            tracing::info!(
                student = %record.student_id,
                event = %record.event_id,
                status = %record.status,
                confidence = record.confidence,
                "attendance recorded"
            );
            Ok(Recorded::Inserted(record))
        } else {
            tracing::debug!(
                student = %record.student_id,
                event = %record.event_id,
                "attendance already recorded"
            );
            Ok(Recorded::AlreadyPresent(record))
        }
    }

    pub async fn find_attendance(
        &self,
        student_id: &StudentId,
        event_id: &EventId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let student = student_id.to_string();
        let event = event_id.to_string();
        let row = self
            .conn
            .call(move |conn| Ok(find_row(conn, &student, &event)?))
            .await?;
        row.map(AttendanceRow::into_record).transpose()
    }

    pub async fn attendance_by_event(
        &self,
        event_id: &EventId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance("WHERE event_id = ?1", vec![event_id.to_string()])
            .await
    }

    pub async fn attendance_by_student(
        &self,
        student_id: &StudentId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance("WHERE student_id = ?1", vec![student_id.to_string()])
            .await
    }

    /// Records recognized within `[start, end]`, inclusive at both ends.
    pub async fn attendance_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance(
            "WHERE recognized_at >= ?1 AND recognized_at <= ?2",
            vec![format_ts(&start), format_ts(&end)],
        )
        .await
    }

    pub async fn all_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_attendance("", Vec::new()).await
    }

    async fn query_attendance(
        &self,
        filter: &'static str,
        args: Vec<String>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{ATTENDANCE_SELECT_SQL} {filter} ORDER BY recognized_at, rowid"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), AttendanceRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(AttendanceRow::into_record).collect()
    }
}
