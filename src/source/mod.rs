// Sample source module
// Sequential provider of compressed access units plus the codec
// initialization unit

pub mod avcc;
pub mod synthetic;

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid stream: {0}")]
    InvalidStream(String),
    #[error("Empty initialization sample")]
    EmptyInitSample,
}

/// One compressed, independently timestamped access unit.
///
/// The payload is reference counted: handing a sample to the decoder clones
/// the handle, never the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    /// Presentation time in microseconds
    pub pts: i64,
    /// Duration in microseconds
    pub duration: i64,
}

impl Sample {
    pub fn new(data: impl Into<Bytes>, pts: i64, duration: i64) -> Self {
        Self {
            data: data.into(),
            pts,
            duration,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Sequential sample provider consumed by the decode engine
pub trait SampleSource: Send {
    /// The codec initialization unit. Idempotent.
    fn init_sample(&self) -> Sample;

    /// Next access unit in decode order, `None` once exhausted
    fn next_sample(&mut self) -> Option<Sample>;

    /// Rewind to the first ordinary sample. The init sample is unaffected.
    fn reset(&mut self);

    /// Number of ordinary samples left, when known
    fn remaining(&self) -> Option<usize> {
        None
    }
}

/// Pre-loaded in-memory stream
#[derive(Debug, Clone)]
pub struct MemorySource {
    init: Sample,
    samples: Vec<Sample>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(init: Sample, samples: Vec<Sample>) -> Result<Self, SourceError> {
        if init.is_empty() {
            return Err(SourceError::EmptyInitSample);
        }
        Ok(Self {
            init,
            samples,
            cursor: 0,
        })
    }

    /// Total number of ordinary samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the next sample to be returned
    pub fn position(&self) -> usize {
        self.cursor
    }
}

impl SampleSource for MemorySource {
    fn init_sample(&self) -> Sample {
        self.init.clone()
    }

    fn next_sample(&mut self) -> Option<Sample> {
        let sample = self.samples.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(sample)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.samples.len().saturating_sub(self.cursor))
    }
}
