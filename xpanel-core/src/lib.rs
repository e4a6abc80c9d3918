//! Core types shared across the xpanel workspace.
//!
//! This crate carries the error taxonomy every other crate maps into, the
//! closed set of wire-protocol tags, and small helpers for byte counts and
//! nullable instants. It has no I/O and no async surface of its own.

mod error;
mod protocol;

pub use error::{Error, Result};
pub use protocol::Protocol;

/// Row id of a panel user. SQLite rowids, never zero for a persisted entity.
pub type UserId = i64;

/// Row id of a declared inbound.
pub type InboundId = i64;

/// Fraction of a quota at which the single-shot warning fires.
pub const DEFAULT_WARNING_RATIO: f64 = 0.8;

/// Render a byte count as a human-readable string for log lines and email
/// bodies. Binary units, two decimals above KiB.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    const TIB: f64 = GIB * 1024.0;

    let b = bytes as f64;
    if b >= TIB {
        format!("{:.2} TiB", b / TIB)
    } else if b >= GIB {
        format!("{:.2} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.2} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.2} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
