use cf_domain::error::Error;

/// Map transport failures to the domain error type. Timeouts stay
/// distinguishable so callers can treat them as temporary.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::ConnectionFailed(e.to_string())
    }
}
