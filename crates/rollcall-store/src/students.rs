//! Student registry: CRUD plus the trained-descriptor view used for matching.

use crate::db::{format_ts, is_constraint_violation, parse_ts, Store, StoreError};
use chrono::Utc;
use rollcall_core::{Descriptor, RegistryEntry, Student, StudentId};
use rusqlite::{params, OptionalExtension, Row};

const STUDENT_SELECT_SQL: &str =
    "SELECT id, name, email, descriptor, created_at, updated_at FROM students";

struct StudentRow {
    id: String,
    name: String,
    email: Option<String>,
    descriptor: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

impl StudentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            descriptor: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_student(self) -> Result<Student, StoreError> {
        let reference = self
            .descriptor
            .map(|bytes| Descriptor::from_le_bytes(&bytes))
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("student {} descriptor: {e}", self.id)))?;
        Ok(Student {
            reference,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
            id: StudentId::from(self.id),
            name: self.name,
            email: self.email,
        })
    }
}

/// Fields for a new student. Students start untrained.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub id: StudentId,
    pub name: String,
    pub email: Option<String>,
}

/// Profile fields to change; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Store {
    pub async fn create_student(&self, new: NewStudent) -> Result<Student, StoreError> {
        if new.id.as_str().trim().is_empty() {
            return Err(StoreError::InvalidInput("student id must not be empty".into()));
        }
        let now = format_ts(&Utc::now());
        let id = new.id.clone();
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, name, email, descriptor, created_at, updated_at)
                     VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
                    params![new.id.as_str(), new.name, new.email, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from);

        match result {
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists {
                kind: "student",
                id: id.to_string(),
            }),
            Err(e) => Err(e),
            Ok(()) => {
                tracing::info!(student = %id, "student created");
                self.require_student(&id).await
            }
        }
    }

    pub async fn get_student(&self, id: &StudentId) -> Result<Option<Student>, StoreError> {
        let key = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("{STUDENT_SELECT_SQL} WHERE id = ?1"),
                        params![key],
                        StudentRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(StudentRow::into_student).transpose()
    }

    async fn require_student(&self, id: &StudentId) -> Result<Student, StoreError> {
        self.get_student(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "student",
            id: id.to_string(),
        })
    }

    /// All students in registration order.
    pub async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{STUDENT_SELECT_SQL} ORDER BY rowid"))?;
                let rows = stmt
                    .query_map([], StudentRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(StudentRow::into_student).collect()
    }

    /// Edit a student's profile. The reference descriptor is untouched.
    pub async fn update_student(
        &self,
        id: &StudentId,
        update: StudentUpdate,
    ) -> Result<Student, StoreError> {
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(StoreError::InvalidInput("student name must not be empty".into()));
        }
        let key = id.to_string();
        let now = format_ts(&Utc::now());
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE students SET
                        name = COALESCE(?1, name),
                        email = COALESCE(?2, email),
                        updated_at = ?3
                     WHERE id = ?4",
                    params![update.name, update.email, now, key],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "student",
                id: id.to_string(),
            });
        }
        tracing::info!(student = %id, "student updated");
        self.require_student(id).await
    }

    /// Attach or overwrite the student's reference descriptor.
    pub async fn set_reference_descriptor(
        &self,
        id: &StudentId,
        descriptor: &Descriptor,
    ) -> Result<Student, StoreError> {
        let key = id.to_string();
        let bytes = descriptor.to_le_bytes();
        let now = format_ts(&Utc::now());
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE students SET descriptor = ?1, updated_at = ?2 WHERE id = ?3",
                    params![bytes, now, key],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "student",
                id: id.to_string(),
            });
        }
        tracing::info!(student = %id, dim = descriptor.len(), "reference descriptor stored");
        self.require_student(id).await
    }

    /// Remove a student from the registry. Attendance history is kept.
    pub async fn delete_student(&self, id: &StudentId) -> Result<bool, StoreError> {
        let key = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM students WHERE id = ?1", params![key])?))
            .await?;
        if deleted > 0 {
            tracing::info!(student = %id, "student deleted");
        }
        Ok(deleted > 0)
    }

    /// Enrolled students with their reference descriptors, in registration order.
    ///
    /// Rows whose stored descriptor cannot be decoded are skipped with a
    /// warning so one corrupt enrollment cannot take matching down.
    pub async fn list_trained(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, descriptor FROM students WHERE descriptor IS NOT NULL ORDER BY rowid",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, bytes) in rows {
            match Descriptor::from_le_bytes(&bytes) {
                Ok(descriptor) => entries.push(RegistryEntry {
                    student_id: StudentId::from(id),
                    descriptor,
                }),
                Err(e) => tracing::warn!(student = %id, error = %e, "skipping malformed reference descriptor"),
            }
        }
        Ok(entries)
    }
}
