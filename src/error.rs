//! Error taxonomy shared by the bus transports, chip drivers and the
//! device manager.

use thiserror::Error;

use crate::{bus::ChipAddress, device::ChipKind};

/// Result alias used by every hardware-facing operation in this crate.
pub type HalResult<T> = Result<T, HalError>;

/// Failures reported by transports, drivers and the manager.
///
/// Channel and digit indices are rejected with [`HalError::InvalidParameter`];
/// duty and percentage values are clamped instead and never produce an error.
#[derive(Debug, Error)]
pub enum HalError {
    /// The bus could not be opened, is closed, or has no target selected.
    #[error("bus {path} unavailable: {reason}")]
    BusUnavailable { path: String, reason: String },

    /// Detection went through every candidate address without an answer,
    /// or no registered device matches a request.
    #[error("no {kind} device found")]
    DeviceNotFound { kind: ChipKind },

    /// A register operation was requested before `initialize` succeeded.
    #[error("{kind} device is not initialized")]
    NotInitialized { kind: ChipKind },

    /// A channel, digit index or address outside its declared range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Read or write failure on an open, addressed bus.
    #[error("transfer to {} failed: {reason}", fmt_address(.address))]
    TransportError {
        address: Option<ChipAddress>,
        reason: String,
    },
}

fn fmt_address(address: &Option<ChipAddress>) -> String {
    address
        .map(|a| a.to_string())
        .unwrap_or_else(|| String::from("<unselected>"))
}

impl HalError {
    pub(crate) fn bus_unavailable(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::BusUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transport(address: Option<ChipAddress>, reason: impl ToString) -> Self {
        Self::TransportError {
            address,
            reason: reason.to_string(),
        }
    }
}
