//! # Fanstorm Media
//!
//! Control of the external media processes used by a load test run:
//!
//! - **Encoder**: pushes a local video file to the broadcast origin
//! - **Decoder**: pulls the broadcast from an edge server in real time
//! - **Progress parsing**: turns the decoder's terminal progress bar into
//!   [`ProgressSample`](fanstorm_core::ProgressSample)s

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod process;
pub mod progress;

pub use decoder::{pump_progress, PlaybackObserver, RtmpdumpObserver, SampleSender};
pub use encoder::{EncoderPush, StreamIngest};
pub use error::{MediaError, MediaResult};
pub use process::find_binary;
pub use progress::{parse_progress, progress_samples, Progress, ProgressLineCodec};
