use std::io::{self, PipeReader, PipeWriter};
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Host side of a freshly spawned helper.
pub(crate) struct HelperChannel {
    pub child: Child,
    /// Records go out here.
    pub request: PipeWriter,
    /// Name lines come back here.
    pub response: PipeReader,
}

/// Spawns `bin <request-pipe> <response-pipe>` with only the two child pipe
/// ends inherited. The host copies of those ends are closed before returning,
/// so the response pipe reports EOF as soon as the helper is gone.
pub(crate) fn spawn_helper(bin: &Path) -> io::Result<HelperChannel> {
    let (child_request, request) = io::pipe()?;
    let (response, child_response) = io::pipe()?;

    let mut cmd = Command::new(bin);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::inherit());

    let child = spawn_with_inherited(cmd, &child_request, &child_response)?;
    drop(child_request);
    drop(child_response);

    Ok(HelperChannel {
        child,
        request,
        response,
    })
}

#[cfg(unix)]
fn spawn_with_inherited(
    mut cmd: Command,
    read_end: &PipeReader,
    write_end: &PipeWriter,
) -> io::Result<Child> {
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt as _;

    let fds = [read_end.as_raw_fd(), write_end.as_raw_fd()];
    cmd.arg(fds[0].to_string()).arg(fds[1].to_string());
    unsafe {
        // Runs in the forked child only; the host keeps close-on-exec.
        cmd.pre_exec(move || {
            for fd in fds {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    cmd.spawn()
}

#[cfg(windows)]
fn spawn_with_inherited(
    mut cmd: Command,
    read_end: &PipeReader,
    write_end: &PipeWriter,
) -> io::Result<Child> {
    use std::os::windows::io::AsRawHandle;
    use std::sync::Mutex;

    // Inheritance is process-wide state; two overlapping spawns would leak
    // each other's pipe ends.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    let handles = [read_end.as_raw_handle(), write_end.as_raw_handle()];
    cmd.arg((handles[0] as usize).to_string())
        .arg((handles[1] as usize).to_string());

    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for h in handles {
        set_inherit(h, true)?;
    }
    let spawned = cmd.spawn();
    for h in handles {
        let _ = set_inherit(h, false);
    }
    spawned
}

#[cfg(windows)]
fn set_inherit(handle: std::os::windows::io::RawHandle, on: bool) -> io::Result<()> {
    use windows_sys::Win32::Foundation::{SetHandleInformation, HANDLE_FLAG_INHERIT};

    let flags = if on { HANDLE_FLAG_INHERIT } else { 0 };
    if unsafe { SetHandleInformation(handle as _, HANDLE_FLAG_INHERIT, flags) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};

    #[test]
    fn child_sees_only_its_two_pipe_ends() {
        // `sh -c '<script>' <request> <response>` binds $0 and $1.
        let script = r#"read -r line <&$0; printf '%s\n' "$line" >&$1"#;
        let (child_request, mut request) = io::pipe().unwrap();
        let (response, child_response) = io::pipe().unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).stdin(Stdio::null());
        let mut child = spawn_with_inherited(cmd, &child_request, &child_response).unwrap();
        drop(child_request);
        drop(child_response);

        request.write_all(b"ping\n").unwrap();
        drop(request);
        let mut line = String::new();
        BufReader::new(response).read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn missing_binary_is_an_io_error() {
        let err = spawn_helper(Path::new("/nonexistent/haltkit-name-helper")).err();
        assert!(err.is_some());
    }
}
