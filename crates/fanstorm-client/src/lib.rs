//! # Fanstorm Platform Client
//!
//! Thin REST wrappers around the streaming platform under test. The load
//! test only talks to the platform through the [`StreamPlatform`] and
//! [`BroadcastOwner`] traits, so orchestration code can be exercised
//! against in-memory fakes.

pub mod api;
pub mod edge;
pub mod error;
pub mod http;

pub use api::*;
pub use edge::{edge_redirect_url, origin_url, parse_edge_redirect};
pub use error::{ClientError, ClientResult};
pub use http::HttpPlatformClient;
