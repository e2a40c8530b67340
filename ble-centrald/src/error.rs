use thiserror::Error;

/// Failure modes of the aggregation core.
#[derive(Debug, Error)]
pub enum BleError {
    /// The scanner could not be started in any mode.
    #[error("scanner {scanner} failed to start: {reason}")]
    ScannerStartFailed { scanner: String, reason: String },

    /// The scanner produced no detections for longer than the watchdog
    /// timeout allows.
    #[error("scanner {scanner} timed out after {seconds:.1}s without detections")]
    ScannerTimeout { scanner: String, seconds: f64 },

    /// The management channel delivered bytes that cannot be framed.
    #[error("management protocol framing error: {0}")]
    ManagementProtocolFraming(String),

    /// The kernel rejected a management command.
    #[error("management command failed with status {status:#04x}")]
    ManagementCommandFailed { status: u8 },

    /// Adapter recovery ran out of options.
    #[error("adapter recovery failed for {adapter}: {reason}")]
    AdapterRecoveryFailed { adapter: String, reason: String },

    /// A subscriber callback panicked during dispatch.
    #[error("subscriber callback failed: {0}")]
    CallbackFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BleError>;
