//! Playback health per subject, computed from the sample stream

use fanstorm_core::{Metric, ProgressSample};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Minimum spacing between two kilobyte samples used for a rate estimate
const RATE_WINDOW_SECS: f64 = 1.0;

/// Slack before a viewer counts as lagging behind the broadcast
const LAG_TOLERANCE_SECS: f64 = 3.0;

/// Health of one viewer's playback
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubjectHealth {
    /// Sample time of the first sample seen for this subject
    pub first_seen: f64,
    pub samples: u64,
    pub kilobytes: f64,
    /// Seconds of media received so far
    pub buffered_seconds: f64,
    /// kB/s between the two most recent samples at least a second apart
    pub rate_kbps: f64,
    /// More time passed than media was buffered, plus tolerance
    pub lagged: bool,
    #[serde(skip)]
    last_rate_point: Option<(f64, f64)>,
}

impl SubjectHealth {
    fn new(first_seen: f64) -> Self {
        Self {
            first_seen,
            ..Default::default()
        }
    }

    fn record(&mut self, sample: &ProgressSample) {
        self.samples += 1;
        let at = sample.elapsed_seconds;

        match sample.metric {
            Metric::KiloBytes => {
                self.kilobytes = sample.value;
                match self.last_rate_point {
                    Some((last_at, last_kb)) if at - last_at > RATE_WINDOW_SECS => {
                        self.rate_kbps = (sample.value - last_kb) / (at - last_at);
                        self.last_rate_point = Some((at, sample.value));
                    }
                    Some(_) => {}
                    None => self.last_rate_point = Some((at, sample.value)),
                }
            }
            Metric::Seconds => {
                self.buffered_seconds = sample.value;
                self.lagged = at - self.first_seen > sample.value + LAG_TOLERANCE_SECS;
            }
            Metric::Percent => {}
        }
    }
}

/// Running health summary across every subject
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlaybackSummary {
    subjects: BTreeMap<String, SubjectHealth>,
}

impl PlaybackSummary {
    pub fn record(&mut self, sample: &ProgressSample) {
        self.subjects
            .entry(sample.subject_id.clone())
            .or_insert_with(|| SubjectHealth::new(sample.elapsed_seconds))
            .record(sample);
    }

    pub fn subject(&self, subject_id: &str) -> Option<&SubjectHealth> {
        self.subjects.get(subject_id)
    }

    pub fn subjects(&self) -> impl Iterator<Item = (&str, &SubjectHealth)> {
        self.subjects.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn lagged_count(&self) -> usize {
        self.subjects.values().filter(|s| s.lagged).count()
    }

    /// Mean receive rate in kbit/s across subjects with a rate estimate
    pub fn average_bitrate_kbits(&self) -> f64 {
        let rates: Vec<f64> = self
            .subjects
            .values()
            .map(|s| s.rate_kbps)
            .filter(|r| *r > 0.0)
            .collect();
        if rates.is_empty() {
            return 0.0;
        }
        rates.iter().sum::<f64>() / rates.len() as f64 * 8.0
    }

    pub fn log_summary(&self) {
        info!(
            "Playback: {} viewers, {} lagged, average {:.1} kbit/s",
            self.subject_count(),
            self.lagged_count(),
            self.average_bitrate_kbits()
        );
    }
}
