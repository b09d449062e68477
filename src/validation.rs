//! Field checks shared by [`crate::config::ScanConfig::validate`].
//!
//! Each check returns a static reason; the caller attaches the field name.
use std::net::SocketAddr;
use std::ops::RangeInclusive;

/// Node address as a literal `ip:port`. Port 0 would bind an ephemeral port
/// the peer could never find, so it is rejected.
pub fn is_valid_endpoint(endpoint: &str) -> Result<(), &'static str> {
    match endpoint.parse::<SocketAddr>() {
        Ok(addr) if addr.port() == 0 => Err("endpoint port must be non-zero"),
        Ok(_) => Ok(()),
        Err(_) => Err("endpoint must be a literal ip:port address"),
    }
}

/// Ledger and results locations. Existence is not checked here; the ledger
/// file is created on first persist.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    match path {
        "" => Err("path is empty"),
        p if p.contains('\0') => Err("path contains a NUL byte"),
        _ => Ok(()),
    }
}

/// Inclusive range check.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    range
        .contains(&value)
        .then_some(())
        .ok_or("value outside the accepted range")
}

/// Timeouts, thresholds and rates: finite and above zero.
pub fn is_positive(value: f64) -> Result<(), &'static str> {
    (value.is_finite() && value > 0.0)
        .then_some(())
        .ok_or("must be finite and greater than zero")
}

/// Rejects empty and whitespace-only strings.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    (!value.trim().is_empty()).then_some(()).ok_or("must not be blank")
}
