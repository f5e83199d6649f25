//! Shared helpers for the adapter.

use cf_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`].
///
/// Timeouts map to [`Error::Timeout`] and everything else to
/// [`Error::ConnectionFailed`] — both temporary, so the retry budget
/// applies.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::ConnectionFailed(e.to_string())
    }
}
