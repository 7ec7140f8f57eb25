//! Playback progress extraction from decoder diagnostics
//!
//! The decoder redraws a terminal progress bar on stderr, so consecutive
//! updates are separated by `\r` rather than `\n`. Both are treated as
//! record boundaries, and whatever is left when the stream ends is emitted
//! as a last record.

use bytes::BytesMut;
use fanstorm_core::{Metric, ProgressSample};
use futures::{future, stream, Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, FramedRead};

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*kB\s*/\s*(\d+(?:\.\d+)?)\s*sec\s*\(\s*(\d+(?:\.\d+)?)\s*%\s*\)")
        .expect("static progress pattern")
});

/// One decoded progress bar update
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub kilobytes: f64,
    pub seconds: f64,
    pub percent: f64,
}

impl Progress {
    /// Fan the update out into one sample per metric, all stamped `elapsed_seconds`
    pub fn samples(&self, subject: &str, elapsed_seconds: f64) -> [ProgressSample; 3] {
        let sample = |metric, value| ProgressSample {
            subject_id: subject.to_string(),
            elapsed_seconds,
            metric,
            value,
        };
        [
            sample(Metric::KiloBytes, self.kilobytes),
            sample(Metric::Seconds, self.seconds),
            sample(Metric::Percent, self.percent),
        ]
    }
}

/// Match a `<kB> kB / <sec> sec (<pct> %)` record.
///
/// Anything else, including a record whose numbers fail to parse, yields
/// `None`.
pub fn parse_progress(line: &str) -> Option<Progress> {
    let captures = PROGRESS_LINE.captures(line)?;
    let field = |i: usize| captures.get(i)?.as_str().parse::<f64>().ok();

    Some(Progress {
        kilobytes: field(1)?,
        seconds: field(2)?,
        percent: field(3)?,
    })
}

/// Splits a byte stream on `\n` or `\r`
#[derive(Debug, Default)]
pub struct ProgressLineCodec {
    /// Bytes already scanned without finding a boundary
    scanned: usize,
}

impl Decoder for ProgressLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let boundary = buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r');

            let Some(offset) = boundary else {
                self.scanned = buf.len();
                return Ok(None);
            };

            let record = buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let record = &record[..record.len() - 1];
            if record.is_empty() {
                // "\r\n" and repeated redraws leave empty records
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(record).into_owned()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(record) = self.decode(buf)? {
            return Ok(Some(record));
        }
        self.scanned = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

/// Lazily turn a decoder's diagnostic output into progress samples.
///
/// Samples are stamped with the time elapsed since `started`, the
/// subject's own workflow start, so samples from different subjects share
/// a clock. The stream ends when `reader` reaches end of input or fails.
pub fn progress_samples<R>(
    reader: R,
    subject: String,
    started: Instant,
) -> impl Stream<Item = ProgressSample>
where
    R: AsyncRead + Unpin,
{
    FramedRead::new(reader, ProgressLineCodec::default())
        .take_while(|record| future::ready(record.is_ok()))
        .filter_map(|record| future::ready(record.ok().as_deref().and_then(parse_progress)))
        .flat_map(move |progress| {
            let elapsed = started.elapsed().as_secs_f64();
            stream::iter(progress.samples(&subject, elapsed))
        })
}
