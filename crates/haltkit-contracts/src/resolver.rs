use std::time::Duration;

use crate::HandleRecord;

/// The one capability the handle-closing sweep consumes.
///
/// `get_name` returns `Ok(None)` both when the handle has no resolvable name
/// and when the lookup did not finish within `timeout`; callers cannot and
/// need not tell the two apart.
pub trait NameResolver: Send + Sync {
    /// (Re)initializes the underlying executor or workers. Safe to call
    /// repeatedly; a second call replaces everything the first one built.
    fn start(&self) -> Result<(), ResolveError>;

    fn get_name(
        &self,
        record: &HandleRecord,
        timeout: Duration,
    ) -> Result<Option<String>, ResolveError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The kernel explicitly refused the query.
    AccessDenied {
        owner_pid: u64,
        handle_value: u64,
    },
    /// Malformed or undersized data on the helper wire.
    ProtocolViolation(String),
    /// The growable name buffer would exceed its hard ceiling.
    ResourceExhaustion {
        requested: usize,
        ceiling: usize,
    },
    /// Broken pipe, early child exit or bad handshake while starting.
    TransportFailure(String),
    /// Thread creation, context access or a wait primitive failed.
    Executor(String),
    Unsupported(&'static str),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::AccessDenied {
                owner_pid,
                handle_value,
            } => write!(
                f,
                "object name query denied for handle {handle_value:#x} of pid {owner_pid}"
            ),
            ResolveError::ProtocolViolation(why) => write!(f, "helper protocol violation: {why}"),
            ResolveError::ResourceExhaustion { requested, ceiling } => write!(
                f,
                "name buffer of {requested} bytes exceeds the {ceiling} byte ceiling"
            ),
            ResolveError::TransportFailure(why) => write!(f, "helper transport failure: {why}"),
            ResolveError::Executor(why) => write!(f, "syscall executor failure: {why}"),
            ResolveError::Unsupported(what) => write!(f, "unsupported on this platform: {what}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl<R: NameResolver + ?Sized> NameResolver for Box<R> {
    fn start(&self) -> Result<(), ResolveError> {
        (**self).start()
    }

    fn get_name(
        &self,
        record: &HandleRecord,
        timeout: Duration,
    ) -> Result<Option<String>, ResolveError> {
        (**self).get_name(record, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_names_the_handle() {
        let e = ResolveError::AccessDenied {
            owner_pid: 812,
            handle_value: 0x4c,
        };
        assert_eq!(
            e.to_string(),
            "object name query denied for handle 0x4c of pid 812"
        );
    }

    #[test]
    fn exhaustion_reports_both_sizes() {
        let e = ResolveError::ResourceExhaustion {
            requested: 2048,
            ceiling: 1024,
        };
        assert!(e.to_string().contains("2048"));
        assert!(e.to_string().contains("1024"));
    }
}
