use thiserror::Error;

use crate::backend::BackendError;

/// Result type for identity store operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Errors surfaced by `UserStore` and `OrganisationStore`.
///
/// Every variant that comes out of a store call names the operation and,
/// where one is involved, the record key, so callers can diagnose without
/// re-running the request.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("{operation}: record not found: {key}")]
    NotFound { operation: &'static str, key: String },

    #[error("{operation}: record already exists: {key}")]
    AlreadyExists { operation: &'static str, key: String },

    #[error("{operation}: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("{operation}: transaction aborted: {reason}")]
    TransactionAborted { operation: &'static str, reason: String },

    #[error("{operation}: store unavailable for {key}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("{operation}: deadline exceeded for {key}")]
    Timeout { operation: &'static str, key: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },
}

impl IdentityError {
    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn not_found(operation: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            key: key.into(),
        }
    }

    pub fn already_exists(operation: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            operation,
            key: key.into(),
        }
    }

    pub fn decode(operation: &'static str, source: DecodeError) -> Self {
        Self::Decode { operation, source }
    }

    /// Classify the error for transport layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::TransactionAborted { .. } => ErrorKind::TransactionAborted,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Invalid { .. } => ErrorKind::Invalid,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Feathers-ish JSON payload, the same shape dog-core errors use.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.kind().name(),
            "message": self.to_string(),
            "code": self.kind().status_code(),
        })
    }
}

/// Coarse error classes with their conventional HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,           // 404
    AlreadyExists,      // 409
    Decode,             // 500
    TransactionAborted, // 409
    StoreUnavailable,   // 503
    Timeout,            // 504
    Invalid,            // 400
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::Decode => 500,
            ErrorKind::TransactionAborted => 409,
            ErrorKind::StoreUnavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Invalid => 400,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::TransactionAborted => "TransactionAborted",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Invalid => "Invalid",
        }
    }
}

/// A record of a recognised kind had the wrong shape.
///
/// Produced by the record codec and the projection engine. Always fatal to
/// the read that hit it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} record {key}: missing field `{field}`")]
    MissingField {
        kind: &'static str,
        key: String,
        field: &'static str,
    },

    #[error("{kind} record {key}: field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        kind: &'static str,
        key: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("{kind} record {key}: field `{field}` is malformed: {reason}")]
    Malformed {
        kind: &'static str,
        key: String,
        field: &'static str,
        reason: String,
    },

    #[error("partition {partition} has no {kind} record")]
    MissingRecord { kind: &'static str, partition: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        let err = IdentityError::not_found("userStore.get", "user/a@example.com|user");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().status_code(), 404);
        assert!(err.is_not_found());

        let err = IdentityError::already_exists("organisationStore.create", "organisation/x");
        assert_eq!(err.kind().status_code(), 409);
        assert!(err.is_already_exists());
    }

    #[test]
    fn messages_carry_operation_and_key() {
        let err = IdentityError::not_found("userStore.get", "user/a@example.com|user");
        assert_eq!(
            err.to_string(),
            "userStore.get: record not found: user/a@example.com|user"
        );

        let err = IdentityError::decode(
            "userStore.getDetails",
            DecodeError::MissingField {
                kind: "user",
                key: "user/a@example.com|user".into(),
                field: "email",
            },
        );
        assert!(err.to_string().contains("missing field `email`"));
    }

    #[test]
    fn json_payload_shape() {
        let json = IdentityError::invalid("email must not be empty").to_json();
        assert_eq!(json["name"], "Invalid");
        assert_eq!(json["code"], 400);
        assert_eq!(json["message"], "Invalid request: email must not be empty");
    }
}
