//! Step event side channel.
//!
//! The filter reports what each phase did through [StepEvent]s delivered to registered [StepObserver]s. Observers
//! only ever see finished phases and cannot change the outcome of a step; they exist for logging, recording and
//! replay.
use std::io::Write;

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What a filter phase produced.
#[derive(Clone, Debug, PartialEq)]
pub enum StepEvent {
    /// Scan matching finished for every particle.
    MatchCompleted {
        step: u64,
        mean_score: f64,
        rejected: usize,
        particles: usize,
    },
    /// Weights were normalized.
    WeightsNormalized { step: u64, neff: f64 },
    /// The population was resampled from `indexes`.
    Resampled { step: u64, indexes: Vec<usize> },
    /// Every particle was extended by one trajectory node without resampling.
    Extended { step: u64, particles: usize },
}

pub trait StepObserver: Send {
    fn on_event(&mut self, event: &StepEvent);
}

/// Writes step events through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;
impl StepObserver for LogObserver {
    fn on_event(&mut self, event: &StepEvent) {
        match event {
            StepEvent::MatchCompleted {
                step,
                mean_score,
                rejected,
                particles,
            } => info!(
                "step {step}: average scan matching score {mean_score:.3} ({rejected}/{particles} matches rejected)"
            ),
            StepEvent::WeightsNormalized { step, neff } => debug!("step {step}: neff {neff:.3}"),
            StepEvent::Resampled { step, indexes } => {
                info!("step {step}: resampled {} particles", indexes.len());
                trace!("step {step}: resample indexes {indexes:?}");
            }
            StepEvent::Extended { step, particles } => {
                debug!("step {step}: extended {particles} lineages")
            }
        }
    }
}

/// One row of a step trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub resampled: bool,
    pub neff: f64,
    pub mean_score: f64,
    pub rejected: usize,
    /// Particle count after the step.
    pub particles: usize,
    /// Resample indexes separated by spaces; empty when the step did not resample.
    pub indexes: String,
}
impl StepRecord {
    /// Parse the `indexes` column back into source indexes.
    pub fn index_list(&self) -> Vec<usize> {
        self.indexes
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// Folds the events of a step into a [StepRecord].
#[derive(Clone, Debug, Default)]
pub struct StepRecorder {
    pending: StepRecord,
}
impl StepRecorder {
    /// Absorb an event; returns the finished record when the event closes a step.
    pub fn record(&mut self, event: &StepEvent) -> Option<StepRecord> {
        match event {
            StepEvent::MatchCompleted {
                step,
                mean_score,
                rejected,
                ..
            } => {
                self.pending = StepRecord {
                    step: *step,
                    mean_score: *mean_score,
                    rejected: *rejected,
                    ..StepRecord::default()
                };
                None
            }
            StepEvent::WeightsNormalized { neff, .. } => {
                self.pending.neff = *neff;
                None
            }
            StepEvent::Resampled { indexes, .. } => {
                self.pending.resampled = true;
                self.pending.particles = indexes.len();
                self.pending.indexes = indexes
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(std::mem::take(&mut self.pending))
            }
            StepEvent::Extended { particles, .. } => {
                self.pending.resampled = false;
                self.pending.particles = *particles;
                Some(std::mem::take(&mut self.pending))
            }
        }
    }
}

/// Writes one CSV row per step.
///
/// Write failures are logged and otherwise ignored so that tracing never affects the filter; call
/// [CsvTraceWriter::flush] to surface them.
pub struct CsvTraceWriter<W: Write> {
    writer: csv::Writer<W>,
    recorder: StepRecorder,
    failed: bool,
}
impl<W: Write> CsvTraceWriter<W> {
    pub fn new(inner: W) -> Self {
        CsvTraceWriter {
            writer: csv::Writer::from_writer(inner),
            recorder: StepRecorder::default(),
            failed: false,
        }
    }
    /// Flush buffered rows.
    ///
    /// # Errors
    /// Returns the underlying I/O error, or a generic one if an earlier row could not be written.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.failed {
            return Err(std::io::Error::other("a step trace row could not be written").into());
        }
        Ok(())
    }
    /// Flush and return the wrapped writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }
}
impl CsvTraceWriter<std::fs::File> {
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Ok(CsvTraceWriter::new(std::fs::File::create(path)?))
    }
}
impl<W: Write + Send> StepObserver for CsvTraceWriter<W> {
    fn on_event(&mut self, event: &StepEvent) {
        if let Some(record) = self.recorder.record(event)
            && let Err(e) = self.writer.serialize(&record)
        {
            log::warn!("failed to write step trace row {}: {e}", record.step);
            self.failed = true;
        }
    }
}

/// Read a step trace written by [CsvTraceWriter].
pub fn read_trace<R: std::io::Read>(reader: R) -> Result<Vec<StepRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        records.push(result?);
    }
    Ok(records)
}
