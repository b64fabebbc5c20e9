use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error("expected {expected}-dim descriptor, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("malformed descriptor payload: {0}")]
    Malformed(String),
}

/// Face descriptor vector produced by the external detector (128-dim for face-api models).
///
/// Immutable once built. Every constructor validates its input, so a
/// `Descriptor` that exists is non-empty and contains only finite values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    /// Build a descriptor and require an exact dimension.
    pub fn with_len(values: Vec<f32>, expected: usize) -> Result<Self, DescriptorError> {
        if values.len() != expected {
            return Err(DescriptorError::WrongLength {
                expected,
                actual: values.len(),
            });
        }
        Self::new(values)
    }

    /// Parse an untyped JSON number array (as sent by browser-side detectors).
    pub fn from_json(text: &str, expected: usize) -> Result<Self, DescriptorError> {
        let values: Vec<f32> =
            serde_json::from_str(text).map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        Self::with_len(values, expected)
    }

    /// Decode the packed little-endian f32 representation used for storage.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() % 4 != 0 {
            return Err(DescriptorError::Malformed(format!(
                "{} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// The mean of finite, equal-length descriptors is itself a valid descriptor.
    pub(crate) fn from_validated_mean(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false: empty descriptors are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance, or `None` when the two descriptors have different lengths.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.values
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable, caller-assigned student identity (e.g. a matriculation number).
    StudentId
);
string_id!(EventId);
string_id!(
    /// Ledger row identity, a UUID v4 minted only when a record is inserted.
    RecordId
);

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A registered student. `reference` is present only after enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub email: Option<String>,
    pub reference: Option<Descriptor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    pub fn is_trained(&self) -> bool {
        self.reference.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One participant in matching: a student together with its reference descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub student_id: StudentId,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    /// Reserved for roll-closing logic outside the recognition path.
    Absent,
}

impl AttendanceStatus {
    /// Lateness is strict: recognition at exactly the start instant is on time.
    pub fn derive(recognized_at: DateTime<Utc>, event_start: DateTime<Utc>) -> Self {
        if recognized_at > event_start {
            Self::Late
        } else {
            Self::Present
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown attendance status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for AttendanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "late" => Ok(Self::Late),
            "absent" => Ok(Self::Absent),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A ledger entry. At most one exists per `(student_id, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: RecordId,
    pub student_id: StudentId,
    pub event_id: EventId,
    /// Display confidence in [0, 1].
    pub confidence: f32,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_descriptor_rejects_empty() {
        assert_eq!(Descriptor::new(vec![]), Err(DescriptorError::Empty));
    }

    #[test]
    fn test_descriptor_rejects_nan() {
        let err = Descriptor::new(vec![0.0, f32::NAN]).unwrap_err();
        assert_eq!(err, DescriptorError::NonFinite { index: 1 });
    }

    #[test]
    fn test_descriptor_from_json_checks_length() {
        let err = Descriptor::from_json("[0.1, 0.2]", 3).unwrap_err();
        assert_eq!(err, DescriptorError::WrongLength { expected: 3, actual: 2 });

        let ok = Descriptor::from_json("[0.1, 0.2, 0.3]", 3).unwrap();
        assert_eq!(ok.values(), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_descriptor_from_json_rejects_strings() {
        let err = Descriptor::from_json(r#"["a", "b"]"#, 2).unwrap_err();
        assert!(matches!(err, DescriptorError::Malformed(_)));
    }

    #[test]
    fn test_descriptor_bytes_exact() {
        let original = d(&[0.1, -3.25, 1e-7, 42.0]);
        let decoded = Descriptor::from_le_bytes(&original.to_le_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_descriptor_bytes_bad_length() {
        assert!(Descriptor::from_le_bytes(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = d(&[0.0, 0.0]);
        let b = d(&[3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), Some(5.0));
    }

    #[test]
    fn test_euclidean_distance_length_mismatch() {
        let a = d(&[0.0, 0.0]);
        let b = d(&[0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_descriptor_serde_validates() {
        let parsed: Result<Descriptor, _> = serde_json::from_str("[]");
        assert!(parsed.is_err());
        let parsed: Descriptor = serde_json::from_str("[1.0, 2.0]").unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "[1.0,2.0]");
    }

    #[test]
    fn test_status_on_time_at_exact_start() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(AttendanceStatus::derive(start, start), AttendanceStatus::Present);
        assert_eq!(
            AttendanceStatus::derive(start - Duration::minutes(5), start),
            AttendanceStatus::Present
        );
    }

    #[test]
    fn test_status_late_one_ms_after_start() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(
            AttendanceStatus::derive(start + Duration::milliseconds(1), start),
            AttendanceStatus::Late
        );
    }

    #[test]
    fn test_status_tokens() {
        for status in [AttendanceStatus::Present, AttendanceStatus::Late, AttendanceStatus::Absent] {
            assert_eq!(status.as_str().parse::<AttendanceStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_string(&AttendanceStatus::Late).unwrap(), "\"late\"");
        assert!("tardy".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_record_id_is_uuid() {
        let id = RecordId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, RecordId::generate());
    }
}
