//! Command implementations. Each returns a serializable report that `main`
//! prints as JSON.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRecord, Descriptor, Enrollment, EuclideanMatcher, Event, EventId, MatchOutcome,
    Matcher, Settings, Student, StudentId,
};
use rollcall_store::{NewEvent, NewStudent, RecordRequest, Store};
use serde::Serialize;
use std::path::PathBuf;

/// Student as shown to operators; the reference vector itself is omitted.
#[derive(Debug, Serialize)]
pub struct StudentView {
    pub id: StudentId,
    pub name: String,
    pub email: Option<String>,
    pub trained: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Student> for StudentView {
    fn from(s: Student) -> Self {
        Self {
            trained: s.is_trained(),
            id: s.id,
            name: s.name,
            email: s.email,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

pub async fn add_student(
    store: &Store,
    id: String,
    name: String,
    email: Option<String>,
) -> Result<StudentView> {
    let student = store
        .create_student(NewStudent {
            id: StudentId::from(id),
            name,
            email,
        })
        .await?;
    Ok(student.into())
}

pub async fn list_students(store: &Store) -> Result<Vec<StudentView>> {
    Ok(store
        .list_students()
        .await?
        .into_iter()
        .map(StudentView::from)
        .collect())
}

/// Parse enrollment samples: a JSON array whose items are descriptor arrays,
/// or `null` for frames in which no face was detected.
pub fn parse_samples(text: &str, descriptor_len: usize) -> Result<Vec<Option<Descriptor>>> {
    let raw: Vec<Option<Vec<f32>>> = serde_json::from_str(text)
        .context("samples must be a JSON array of descriptor arrays or nulls")?;
    raw.into_iter()
        .enumerate()
        .map(|(i, sample)| {
            sample
                .map(|values| Descriptor::with_len(values, descriptor_len))
                .transpose()
                .with_context(|| format!("sample {i}"))
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct EnrollReport {
    pub student: StudentView,
    pub collected: usize,
    /// Frames without a face.
    pub skipped: usize,
    /// Faces beyond the sample target.
    pub ignored: usize,
}

/// Average the samples into the student's reference descriptor, replacing
/// any previous enrollment.
pub async fn enroll(
    store: &Store,
    student_id: &StudentId,
    samples: Vec<Option<Descriptor>>,
    min_samples: usize,
) -> Result<EnrollReport> {
    if store.get_student(student_id).await?.is_none() {
        bail!("student not found: {student_id}");
    }

    let mut enrollment = Enrollment::new(min_samples);
    let mut ignored = 0;
    for sample in samples {
        let has_face = sample.is_some();
        if !enrollment.offer(sample) && has_face {
            ignored += 1;
        }
    }
    let collected = enrollment.collected();
    let skipped = enrollment.skipped();
    tracing::debug!(collected, skipped, ignored, "enrollment samples collected");

    let reference = enrollment.finish(min_samples)?;
    let student = store.set_reference_descriptor(student_id, &reference).await?;
    Ok(EnrollReport {
        student: student.into(),
        collected,
        skipped,
        ignored,
    })
}

pub async fn add_event(
    store: &Store,
    new: NewEvent,
    activate: bool,
) -> Result<Event> {
    let event = store.create_event(new).await?;
    if activate {
        return Ok(store.set_active_event(&event.id).await?);
    }
    Ok(event)
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MatchReport {
    pub matched: bool,
    pub student_id: Option<StudentId>,
    pub distance: Option<f32>,
    pub confidence: Option<f32>,
    /// Closest distance seen when nothing was within the threshold.
    pub nearest: Option<f32>,
    pub registry_size: usize,
}

/// One-shot identification against the current registry.
pub async fn match_descriptor(
    store: &Store,
    live: &Descriptor,
    threshold: f32,
) -> Result<MatchReport> {
    let registry = store.list_trained().await?;
    let report = match EuclideanMatcher.compare(live, &registry, threshold) {
        MatchOutcome::Matched(m) => MatchReport {
            matched: true,
            student_id: Some(m.student_id),
            distance: Some(m.distance),
            confidence: Some(m.confidence),
            nearest: None,
            registry_size: registry.len(),
        },
        MatchOutcome::NoMatch { nearest } => MatchReport {
            matched: false,
            student_id: None,
            distance: None,
            confidence: None,
            nearest,
            registry_size: registry.len(),
        },
    };
    Ok(report)
}

#[derive(Debug, Serialize)]
pub struct RecordReport {
    pub inserted: bool,
    pub record: AttendanceRecord,
}

/// Manually record attendance through the ledger. An existing record for the
/// pair is reported unchanged.
pub async fn record(
    store: &Store,
    student_id: StudentId,
    event_id: EventId,
    confidence: f32,
    at: Option<DateTime<Utc>>,
) -> Result<RecordReport> {
    if store.get_student(&student_id).await?.is_none() {
        bail!("student not found: {student_id}");
    }
    let event = store
        .get_event(&event_id)
        .await?
        .with_context(|| format!("event not found: {event_id}"))?;

    let recorded = store
        .record_if_absent(RecordRequest {
            student_id,
            event_id,
            confidence,
            recognized_at: at.unwrap_or_else(Utc::now),
            event_start: event.start_time,
        })
        .await?;
    Ok(RecordReport {
        inserted: recorded.was_inserted(),
        record: recorded.into_record(),
    })
}

pub enum AttendanceFilter {
    All,
    Event(EventId),
    Student(StudentId),
    Between(DateTime<Utc>, DateTime<Utc>),
}

pub async fn attendance(store: &Store, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
    let records = match filter {
        AttendanceFilter::All => store.all_attendance().await?,
        AttendanceFilter::Event(id) => store.attendance_by_event(&id).await?,
        AttendanceFilter::Student(id) => store.attendance_by_student(&id).await?,
        AttendanceFilter::Between(from, to) => {
            if from > to {
                bail!("--from must not be after --to");
            }
            store.attendance_between(from, to).await?
        }
    };
    Ok(records)
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub db_path: PathBuf,
    pub schema_version: u32,
    pub students: usize,
    pub trained: usize,
    pub events: usize,
    pub active_event: Option<EventId>,
    pub match_threshold: f32,
    pub descriptor_len: usize,
}

pub async fn status(store: &Store, settings: &Settings) -> Result<StatusReport> {
    Ok(StatusReport {
        db_path: settings.db_path.clone(),
        schema_version: store.schema_version().await?,
        students: store.list_students().await?.len(),
        trained: store.list_trained().await?.len(),
        events: store.list_events().await?.len(),
        active_event: store.active_event().await?.map(|e| e.id),
        match_threshold: settings.match_threshold,
        descriptor_len: settings.descriptor_len,
    })
}
