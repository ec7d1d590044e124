//! The helper side of the name-resolution pipe protocol.
//!
//! A helper writes the banner line, then answers each 40-byte
//! [`HandleRecord`] with one `name\n` line, or with nothing when the handle
//! has no name. The host enforces all deadlines; a helper may block.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Duration;

use haltkit_contracts::{HandleRecord, ResolveError, HANDLE_RECORD_LEN, HELPER_BANNER};

/// Where a helper gets names from.
pub trait NameSource {
    fn name_of(&mut self, record: &HandleRecord) -> Result<Option<String>, ResolveError>;
}

/// The ordinary, unbounded kernel query.
#[derive(Debug, Default)]
pub struct DirectSource;

impl NameSource for DirectSource {
    fn name_of(&mut self, record: &HandleRecord) -> Result<Option<String>, ResolveError> {
        haltkit_syscall::query_object_name_blocking(record)
    }
}

/// Scripted answers for exercising hosts: the name is
/// `\Echo\<pid>\<handle>`, `granted_access` is a delay in milliseconds and
/// [`EchoSource::NO_ANSWER`] is never answered.
#[derive(Debug, Default)]
pub struct EchoSource;

impl EchoSource {
    pub const NO_ANSWER: u16 = 0xffff;
    /// Handled by the echo binary: the process exits mid-request.
    pub const EXIT: u16 = 0xfffe;

    pub fn name_for(record: &HandleRecord) -> String {
        format!("\\Echo\\{}\\{}", record.owner_pid, record.handle_value)
    }
}

impl NameSource for EchoSource {
    fn name_of(&mut self, record: &HandleRecord) -> Result<Option<String>, ResolveError> {
        if record.granted_access > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(record.granted_access)));
        }
        if record.object_type_index == Self::NO_ANSWER {
            return Ok(None);
        }
        Ok(Some(Self::name_for(record)))
    }
}

pub fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = reader.read(&mut buf[off..])?;
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF",
            ));
        }
        off += n;
    }
    Ok(true)
}

/// Runs the helper protocol until the request pipe ends. Only pipe I/O
/// errors are returned; a handle that cannot be named is skipped.
pub fn serve(
    reader: &mut impl Read,
    writer: &mut impl Write,
    source: &mut impl NameSource,
) -> io::Result<()> {
    writer.write_all(HELPER_BANNER.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut buf = [0u8; HANDLE_RECORD_LEN];
    loop {
        match read_exact_or_eof(reader, &mut buf) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let Ok(record) = HandleRecord::decode(&buf) else {
            continue;
        };
        let name = match source.name_of(&record) {
            Ok(Some(name)) => name,
            Ok(None) | Err(_) => continue,
        };
        // One line per answer; the protocol cannot carry a line break.
        if name.contains(['\n', '\r']) {
            continue;
        }
        writer.write_all(name.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
}

/// Opens a pipe end inherited from the host, given its decimal id.
pub fn open_inherited(id: &str) -> io::Result<File> {
    let raw: u64 = id.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pipe id {id:?}"),
        )
    })?;
    open_raw(raw)
}

#[cfg(unix)]
fn open_raw(raw: u64) -> io::Result<File> {
    use std::os::fd::FromRawFd;

    let fd = i32::try_from(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pipe id out of range"))?;
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(windows)]
fn open_raw(raw: u64) -> io::Result<File> {
    use std::os::windows::io::{FromRawHandle, RawHandle};

    if raw == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "null pipe handle"));
    }
    Ok(unsafe { File::from_raw_handle(raw as usize as RawHandle) })
}
