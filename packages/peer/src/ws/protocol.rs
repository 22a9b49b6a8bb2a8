//! Inbound frame parsing shared by the socket endpoints.

use std::collections::HashSet;

/// First info notification on a diff connection.
pub const DIFF_WELCOME: &str = "Welcome! Send a JSON list of chat ids to start watching";

#[derive(Debug, thiserror::Error)]
pub enum WatchListError {
    #[error("watch list is not a JSON array of strings: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse a frame like `["c1","c2"]` into the chat ids to watch.
///
/// Blank ids are skipped and repeats collapse to their first occurrence, so the
/// returned list is what the connection ends up subscribed to.
pub fn parse_watch_list(frame: &str) -> Result<Vec<String>, WatchListError> {
    let raw: Vec<String> = serde_json::from_str(frame)?;
    let mut seen = HashSet::new();
    Ok(raw
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .collect())
}

/// Text carried by a binary frame. `None` unless it is valid UTF-8.
pub fn binary_text(data: &[u8]) -> Option<String> {
    String::from_utf8(data.to_vec()).ok()
}
