//! Media server URL helpers

use crate::error::{ClientError, ClientResult};
use once_cell::sync::Lazy;
use regex::Regex;

static SMIL_BASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<meta\s[^>]*\bbase\s*=\s*"([^"]+)""#).expect("static SMIL pattern")
});

/// Application instance placeholder the redirect service leaves in edge URLs
const DEFAULT_INSTANCE: &str = "_definst_";

/// Ingest URL the encoder pushes to
pub fn origin_url(host: &str, port: u16, stream_name: &str) -> String {
    format!("rtmp://{}:{}/live/{}", host, port, stream_name)
}

/// Redirect endpoint that assigns viewers to an edge server
pub fn edge_redirect_url(host: &str, port: u16, stream_name: &str) -> String {
    format!("http://{}:{}/redirect/live/{}", host, port, stream_name)
}

/// Extract the edge playback URL from a SMIL redirect document
pub fn parse_edge_redirect(body: &str, stream_name: &str) -> ClientResult<String> {
    let base = SMIL_BASE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| ClientError::EdgeRedirect("no <meta base=...> in redirect response".to_string()))?;

    Ok(base.replacen(DEFAULT_INSTANCE, stream_name, 1))
}
