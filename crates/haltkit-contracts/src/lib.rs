//! Shared, version-pinned contracts between the shutdown host, the name
//! resolution engine and its helper processes.
//!
//! The wire layout of [`HandleRecord`] and the helper handshake are the only
//! bytes that cross a process boundary; everything that encodes or decodes
//! them lives here.

use std::time::Duration;

mod record;
mod resolver;

pub use record::{HandleRecord, HandleSnapshot, HANDLE_RECORD_LEN};
pub use resolver::{NameResolver, ResolveError};

pub const HANDLE_RECORD_SCHEMA_VERSION: &str = "haltkit.handle-record@1";
pub const NAMES_REPORT_SCHEMA_VERSION: &str = "haltkit.names.report@0.1.0";

/// Line the helper writes once its pipe ends are open.
pub const HELPER_BANNER: &str = ".";

/// Longest response line a host accepts from a helper, newline excluded.
pub const MAX_RESPONSE_LINE_BYTES: usize = 256 * 1024;

pub const DEFAULT_NAME_TIMEOUT: Duration = Duration::from_millis(100);
