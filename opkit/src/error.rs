//! Error handling in [`opkit`][crate]
use thiserror::Error;

/// Convenience alias for boxed callback errors.
///
/// Reconciler and hook callbacks return whatever error type suits the
/// application; it is carried here and wrapped before being surfaced.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Possible errors when working with [`opkit`][crate]
///
/// Environmental and store failures are returned through this type; misuse of
/// the library (registration after connect, a client used before connect,
/// missing mandatory observability or leader-election configuration) is a
/// programming error and panics at the point of call instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to infer the kubernetes client configuration from the environment
    #[error("unable to load kubernetes configuration: {0}")]
    InferConfig(#[source] Box<kube::config::InferConfigError>),

    /// Failed to construct the kubernetes client from a loaded configuration
    #[error("unable to build kubernetes client: {0}")]
    BuildClient(#[source] kube::Error),

    /// A kind name was bound more than once within one group/version
    #[error("kind {kind} registered more than once for {api_version}")]
    DuplicateKind {
        /// The `group/version` the kind was registered under
        api_version: String,
        /// The offending kind name
        kind: String,
    },

    /// The same Rust type was bound to more than one kind
    #[error("type {type_name} bound to more than one kind in the scheme")]
    DuplicateType {
        /// Name of the offending Rust type
        type_name: &'static str,
    },

    /// A client or reconciler was requested for a type the scheme does not know
    #[error("type {type_name} is not registered with the cluster scheme")]
    UnregisteredType {
        /// Name of the unknown Rust type
        type_name: &'static str,
    },

    /// A resource passed to a write operation carries no name
    #[error("{type_name} resource has no metadata.name set")]
    MissingObjectName {
        /// Name of the resource type
        type_name: &'static str,
    },

    /// Failed to serialize a resource for a subresource write
    #[error("unable to serialize resource: {0}")]
    Serialize(#[source] serde_json::Error),

    /// An API call against the cluster failed
    #[error("unable to {verb} {type_name}: {source}")]
    Api {
        /// The failed operation
        verb: &'static str,
        /// Name of the resource type the operation was for
        type_name: &'static str,
        /// The underlying client error
        #[source]
        source: kube::Error,
    },

    /// A subresource-scoped update failed
    ///
    /// Earlier subresource updates in the same call may already have been
    /// applied; no rollback is attempted.
    #[error("unable to update subresource {subresource}: {source}")]
    Subresource {
        /// The subresource whose update failed
        subresource: &'static str,
        /// The underlying client error
        #[source]
        source: kube::Error,
    },

    /// A configured reconciler callback returned an error
    #[error("unable to execute configured reconciler for {object}: {source}")]
    Reconcile {
        /// `namespace/name` of the affected object
        object: String,
        /// The callback's error
        #[source]
        source: BoxError,
    },

    /// An admission hook was passed an object that does not narrow to its type
    #[error("admission hook for {expected} received an incompatible object: {source}")]
    HookObject {
        /// Name of the expected resource type
        expected: &'static str,
        /// The narrowing failure
        #[source]
        source: serde_json::Error,
    },

    /// An API call against the coordination Lease failed
    #[error("lease api call failed for {lease}: {source}")]
    Lease {
        /// Name of the lock resource
        lease: String,
        /// The underlying client error
        #[source]
        source: kube::Error,
    },

    /// Leadership was lost after the lease had been acquired
    #[error("leader election lost lease {lease}")]
    LeaseLost {
        /// Name of the lock resource
        lease: String,
    },
}

impl Error {
    /// Whether this error is a not-found response from the cluster API.
    ///
    /// Reconcilers use this to classify a reconcile for a vanished object as
    /// `Deleted`; callers of [`Client::get`](crate::Client::get) can test it
    /// to distinguish absence from environmental failure.
    pub fn is_not_found(&self) -> bool {
        let source = match self {
            Error::Api { source, .. } => source,
            Error::Subresource { source, .. } => source,
            _ => return false,
        };
        matches!(source, kube::Error::Api(resp) if resp.code == 404)
    }
}

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::Error;
    use kube::core::ErrorResponse;

    #[test]
    fn not_found_is_distinguishable() {
        let err = Error::Api {
            verb: "get",
            type_name: "Widget",
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "widgets \"missing\" not found".into(),
                reason: "NotFound".into(),
                code: 404,
            }),
        };
        assert!(err.is_not_found());

        let err = Error::Api {
            verb: "get",
            type_name: "Widget",
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "InternalError".into(),
                code: 500,
            }),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn unregistered_type_mentions_the_type() {
        let err = Error::UnregisteredType { type_name: "Widget" };
        assert!(err.to_string().contains("Widget"));
    }
}
