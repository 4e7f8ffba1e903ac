//! Per-client protocol diagnostics

/// Diagnostic counters owned by one client instance.
///
/// `errors` counts protocol-level error messages and shadow-table
/// consistency violations; `undef` counts messages with an unrecognized
/// `type`. Neither condition closes the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub errors: u64,
    pub undef: u64,
}
