//! SSE line buffering.
//!
//! The upstream emits newline-delimited events: each line is empty, a
//! comment, or `data: <payload>`. Chunks arrive at arbitrary boundaries,
//! so the buffer is drained line by line and any trailing partial line is
//! carried over to the next read.

/// Extract complete `data:` payloads from the buffer.
///
/// The buffer is drained in-place: consumed lines are removed and a
/// trailing partial line (no `\n` yet) remains for the next call.
/// Empty lines and non-`data:` lines (comments, heartbeats) are skipped.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                data_lines.push(data.to_string());
            }
        }
    }

    data_lines
}

/// Flush a trailing partial line at end of stream.
pub(crate) fn flush_remainder(buffer: &mut String) -> Vec<String> {
    if buffer.trim().is_empty() {
        buffer.clear();
        return Vec::new();
    }
    buffer.push('\n');
    drain_data_lines(buffer)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
