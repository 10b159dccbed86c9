use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    /// API misuse, e.g. a nested outbox transaction or collecting outside of one.
    /// Never retried.
    #[snafu(display("Outbox protocol violation: {message}"))]
    Protocol { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Internal error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Failed to encode or decode payload"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Payload schema mismatch: expected {expected}, found {found}"))]
    SchemaMismatch { expected: String, found: String },

    #[snafu(display(
        "Unsupported version {found} of payload {schema} (newest understood is {supported})"
    ))]
    UnsupportedVersion {
        schema: String,
        found: u32,
        supported: u32,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn message_not_found(id: uuid::Uuid) -> Self {
        Self::NotFound {
            resource: format!("outbox message {id}"),
        }
    }

    /// Whether the error is caller misuse rather than an infrastructure failure.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// Whether the error came from the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Sqlx { .. } | Self::MigrationError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let test_cases = vec![
            (Error::protocol("nested"), true, false),
            (Error::from(sqlx::Error::RowNotFound), false, true),
            (Error::not_found("thing"), false, false),
            (Error::invalid_parameter("batch"), false, false),
            (Error::internal(eyre::eyre!("boom")), false, false),
        ];

        for (error, protocol, storage) in test_cases {
            assert_eq!(error.is_protocol(), protocol, "protocol flag for {error}");
            assert_eq!(error.is_storage(), storage, "storage flag for {error}");
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::protocol("Nested outbox transactions are not supported").to_string(),
            "Outbox protocol violation: Nested outbox transactions are not supported"
        );
        assert_eq!(
            Error::SchemaMismatch {
                expected: "order.created".to_owned(),
                found: "order.cancelled".to_owned(),
            }
            .to_string(),
            "Payload schema mismatch: expected order.created, found order.cancelled"
        );
    }
}
