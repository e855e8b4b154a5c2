//! Classification of kube-rs API errors

/// HTTP status returned by the API server for a missing object
const NOT_FOUND: u16 = 404;
/// HTTP status returned by the API server for a create conflict
const CONFLICT: u16 = 409;

/// Returns true when the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == NOT_FOUND)
}

/// Returns true when the API server answered 409 AlreadyExists
///
/// A 409 with a different reason (e.g. an optimistic-lock Conflict) is not
/// treated as pre-existence.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == CONFLICT && ae.reason == "AlreadyExists")
}
