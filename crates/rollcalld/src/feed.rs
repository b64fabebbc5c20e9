//! Line-delimited JSON detection feed.
//!
//! Each non-empty line is one frame from an external detector:
//!
//! ```json
//! {"descriptor": [0.01, -0.2, ...], "luma": [12, 40, ...], "width": 4, "height": 4}
//! ```
//!
//! `descriptor` is `null` (or absent) when no single face was found. `luma`,
//! `width` and `height` are optional. [`FeedSource`] turns lines into frames
//! and [`FeedOracle`] validates the descriptor carried in each frame.

use chrono::Utc;
use rollcall_core::{CaptureError, Descriptor, DescriptorOracle, Frame, FrameSource, OracleError};
use serde::Deserialize;
use std::io::BufRead;
use std::sync::Mutex;

#[derive(Deserialize)]
struct FrameMeta {
    #[serde(default)]
    luma: Option<Vec<u8>>,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

#[derive(Deserialize)]
struct DetectionLine {
    #[serde(default)]
    descriptor: Option<Vec<f32>>,
}

/// Frames read line by line from a reader (stdin or a file).
pub struct FeedSource<R> {
    reader: Mutex<R>,
    sequence: Mutex<u64>,
}

impl<R: BufRead + Send> FeedSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
            sequence: Mutex::new(0),
        }
    }

    fn next_line(&self) -> Result<Option<String>, CaptureError> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| CaptureError::CaptureFailed("feed reader poisoned".into()))?;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Ok(Some(line.trim().to_string()));
            }
        }
    }
}

impl<R: BufRead + Send> FrameSource for FeedSource<R> {
    fn capture(&self) -> Result<Frame, CaptureError> {
        let line = self.next_line()?.ok_or(CaptureError::Exhausted)?;

        // A malformed line still becomes a frame; the oracle reports it.
        let meta = serde_json::from_str::<FrameMeta>(&line).unwrap_or(FrameMeta {
            luma: None,
            width: 0,
            height: 0,
        });

        let mut seq = self
            .sequence
            .lock()
            .map_err(|_| CaptureError::CaptureFailed("sequence counter poisoned".into()))?;
        let sequence = *seq;
        *seq += 1;

        Ok(Frame {
            data: line.into_bytes(),
            luma: meta.luma,
            width: meta.width,
            height: meta.height,
            sequence,
            captured_at: Utc::now(),
        })
    }
}

/// Reads the descriptor an upstream detector already computed for the frame.
pub struct FeedOracle {
    descriptor_len: usize,
}

impl FeedOracle {
    pub fn new(descriptor_len: usize) -> Self {
        Self { descriptor_len }
    }
}

impl DescriptorOracle for FeedOracle {
    fn detect(&self, frame: &Frame) -> Result<Option<Descriptor>, OracleError> {
        let line: DetectionLine = serde_json::from_slice(&frame.data)
            .map_err(|e| OracleError::DetectionFailed(format!("malformed feed line: {e}")))?;
        match line.descriptor {
            None => Ok(None),
            Some(values) => Ok(Some(Descriptor::with_len(values, self.descriptor_len)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::DescriptorError;
    use std::io::Cursor;

    fn source(text: &str) -> FeedSource<Cursor<Vec<u8>>> {
        FeedSource::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_frames_in_order_then_exhausted() {
        let feed = source(
            "{\"descriptor\":[0.1,0.2]}\n\n{\"descriptor\":null,\"luma\":[10,20],\"width\":2,\"height\":1}\n",
        );
        let first = feed.capture().unwrap();
        assert_eq!(first.sequence, 0);
        assert!(first.luma.is_none());

        let second = feed.capture().unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.luma.as_deref(), Some(&[10u8, 20][..]));
        assert_eq!((second.width, second.height), (2, 1));

        assert!(matches!(feed.capture(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_oracle_reads_descriptor() {
        let feed = source("{\"descriptor\":[0.5,-0.5]}\n{\"descriptor\":null}\n{}\n");
        let oracle = FeedOracle::new(2);
        let d = oracle.detect(&feed.capture().unwrap()).unwrap().unwrap();
        assert_eq!(d.values(), &[0.5, -0.5]);
        assert!(oracle.detect(&feed.capture().unwrap()).unwrap().is_none());
        assert!(oracle.detect(&feed.capture().unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_oracle_rejects_wrong_length() {
        let feed = source("{\"descriptor\":[0.5,-0.5,0.1]}\n");
        let err = FeedOracle::new(2).detect(&feed.capture().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            OracleError::InvalidDescriptor(DescriptorError::WrongLength { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_malformed_line_is_oracle_failure() {
        let feed = source("not json\n");
        let frame = feed.capture().unwrap();
        assert!(frame.luma.is_none());
        let err = FeedOracle::new(2).detect(&frame).unwrap_err();
        assert!(matches!(err, OracleError::DetectionFailed(_)));
    }
}
