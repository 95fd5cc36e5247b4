use std::error::Error;

use thiserror::Error;

use crate::backend::BackendError;

/// Reasons for rejecting a delivery request.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The request is missing its bucket or object path.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// The object does not exist at the origin.
    #[error("object not found")]
    NotFound,

    /// The origin denied access to the object.
    #[error("access denied")]
    Forbidden,

    /// The requested range does not fit the object, or the range header is malformed.
    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable {
        /// Size of the object the range was checked against.
        size: u64,
    },

    /// The object is larger than the amount that may be buffered for this request.
    #[error("object of {size} bytes exceeds the limit of {limit} bytes")]
    UpstreamTooLarge {
        /// Size of the object at the origin.
        size: u64,
        /// The applicable limit.
        limit: u64,
    },

    /// An unexpected failure, such as an origin or transfer error.
    #[error("internal error: {context}")]
    Internal {
        /// What was being done when the failure occurred.
        context: String,
        /// The underlying error, if any.
        #[source]
        cause: Option<Box<dyn Error + Send + Sync>>,
    },
}

impl DeliveryError {
    /// Creates an internal error caused by `cause`.
    pub fn internal<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::Internal {
            context: context.into(),
            cause: Some(cause.into()),
        }
    }

    /// Returns the rejection reason used for logging and metrics.
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::BadRequest(_) => RejectReason::BadRequest,
            Self::NotFound => RejectReason::NotFound,
            Self::Forbidden => RejectReason::Forbidden,
            Self::RangeNotSatisfiable { .. } => RejectReason::RangeNotSatisfiable,
            Self::UpstreamTooLarge { .. } => RejectReason::UpstreamTooLarge,
            Self::Internal { .. } => RejectReason::Internal,
        }
    }
}

impl From<BackendError> for DeliveryError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::NotFound => Self::NotFound,
            BackendError::AccessDenied => Self::Forbidden,
            other => Self::internal("origin request failed", other),
        }
    }
}

/// Classification of a [`DeliveryError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// See [`DeliveryError::BadRequest`].
    BadRequest,
    /// See [`DeliveryError::NotFound`].
    NotFound,
    /// See [`DeliveryError::Forbidden`].
    Forbidden,
    /// See [`DeliveryError::RangeNotSatisfiable`].
    RangeNotSatisfiable,
    /// See [`DeliveryError::UpstreamTooLarge`].
    UpstreamTooLarge,
    /// See [`DeliveryError::Internal`].
    Internal,
}

impl RejectReason {
    /// A short identifier, suitable as a metric tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::RangeNotSatisfiable => "range_not_satisfiable",
            Self::UpstreamTooLarge => "upstream_too_large",
            Self::Internal => "internal",
        }
    }
}
