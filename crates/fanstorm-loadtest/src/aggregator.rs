//! Single-consumer merge of every viewer's progress samples

use crate::summary::PlaybackSummary;
use fanstorm_core::ProgressSample;
use fanstorm_media::SampleSender;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Destination for merged samples, one record per call
pub trait SampleSink: Send {
    fn write_sample(&mut self, sample: &ProgressSample) -> Result<(), csv::Error>;
}

/// CSV records `subject,elapsed,metric,value`, flushed after every record
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(inner),
        }
    }

    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}

impl CsvSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> SampleSink for CsvSink<W> {
    fn write_sample(&mut self, sample: &ProgressSample) -> Result<(), csv::Error> {
        self.writer.write_record(sample.to_record())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// True when the reader of the sink has gone away, e.g. the ssh client
/// that relayed our stdout was killed
pub fn is_closed_output(error: &csv::Error) -> bool {
    matches!(error.kind(), csv::ErrorKind::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

/// Parse one CSV line written by [`CsvSink`], e.g. relayed from a worker node
pub fn parse_sample_line(line: &str) -> Option<ProgressSample> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    let record = reader.records().next()?.ok()?;
    let fields: Vec<&str> = record.iter().collect();
    ProgressSample::from_record(&fields)
}

/// What the consumer did before the queue closed
#[derive(Clone, Debug, Default)]
pub struct AggregateReport {
    pub written: u64,
    pub write_errors: u64,
    /// The sink reported a broken pipe
    pub output_closed: bool,
    pub playback: PlaybackSummary,
}

/// Unbounded FIFO with one consumer.
///
/// Producers get a [`SampleSender`] from [`ResultAggregator::sender`];
/// [`ResultAggregator::drain`] returns once all of them are dropped.
#[derive(Debug)]
pub struct ResultAggregator {
    tx: SampleSender,
    rx: mpsc::UnboundedReceiver<ProgressSample>,
    stop_on_closed: Option<CancellationToken>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            stop_on_closed: None,
        }
    }

    /// Cancel `token` once the sink's reader is gone. Nobody is left to
    /// read the results, so the run should end.
    pub fn stop_on_closed_output(mut self, token: CancellationToken) -> Self {
        self.stop_on_closed = Some(token);
        self
    }

    pub fn sender(&self) -> SampleSender {
        self.tx.clone()
    }

    /// Write every queued sample to `sink` as one record.
    ///
    /// A failed write is logged and the sample dropped; draining goes on
    /// until every producer is gone.
    pub async fn drain<S: SampleSink>(self, sink: &mut S) -> AggregateReport {
        let Self {
            tx,
            mut rx,
            stop_on_closed,
        } = self;
        drop(tx);

        let mut report = AggregateReport::default();
        while let Some(sample) = rx.recv().await {
            report.playback.record(&sample);
            match sink.write_sample(&sample) {
                Ok(()) => report.written += 1,
                Err(e) if is_closed_output(&e) => {
                    report.write_errors += 1;
                    if report.output_closed {
                        continue;
                    }
                    report.output_closed = true;
                    match &stop_on_closed {
                        Some(stop) => {
                            warn!("Result output closed, stopping the run");
                            stop.cancel();
                        }
                        None => warn!("Result output closed: {}", e),
                    }
                }
                Err(e) => {
                    warn!("Failed to write sample for {}: {}", sample.subject_id, e);
                    report.write_errors += 1;
                }
            }
        }

        debug!("Result queue closed after {} samples", report.written);
        report
    }
}
