use ferrokraken_core::{StoreError, SyncError, ValidationError};
use ferrokraken_warehouse::WarehouseError;
use thiserror::Error;

pub const EXIT_INVALID_INPUT: u8 = 2;
pub const EXIT_SYNC_FAILED: u8 = 3;
pub const EXIT_CANCELLED: u8 = 130;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => EXIT_INVALID_INPUT,
            Self::Sync(SyncError::Validation(_) | SyncError::AuthConfiguration(_)) => {
                EXIT_INVALID_INPUT
            }
            Self::Sync(SyncError::Cancelled { .. }) => EXIT_CANCELLED,
            Self::Sync(_) | Self::Warehouse(_) | Self::Store(_) => EXIT_SYNC_FAILED,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_problems_exit_with_two() {
        let unknown = ValidationError::UnknownResource {
            name: String::from("orders"),
        };
        assert_eq!(CliError::from(unknown.clone()).exit_code(), 2);
        assert_eq!(CliError::from(SyncError::from(unknown)).exit_code(), 2);
        assert_eq!(
            CliError::from(SyncError::AuthConfiguration(String::from("bad secret"))).exit_code(),
            2
        );
    }

    #[test]
    fn runtime_failures_exit_with_three_and_cancellation_with_130() {
        assert_eq!(
            CliError::from(SyncError::Cancelled {
                resource: String::from("executions"),
            })
            .exit_code(),
            130
        );
        assert_eq!(CliError::from(StoreError::new("disk full")).exit_code(), 3);
        assert_eq!(
            CliError::from(WarehouseError::QueryRejected(String::from("x"))).exit_code(),
            3
        );
    }
}
