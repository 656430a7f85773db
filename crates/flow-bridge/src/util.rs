//! Small helpers shared by [`crate::service`] and [`crate::task_service`].

/// Open an anonymous pipe with `O_CLOEXEC` set on both ends, returning
/// `(read_fd, write_fd)`.
pub fn pipe_cloexec() -> std::io::Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid 2-element buffer for `pipe2` to populate.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// The stricter of Linux's 107-byte and macOS's 104-byte `sockaddr_un` path
/// limits, so a socket path built on either platform is portable.
pub const MAX_SOCKET_PATH_LEN: usize = 104;

/// Build a Unix socket path for `task_name` under `dir`. If the natural
/// `<dir>/<task_name>.sock` path would exceed [`MAX_SOCKET_PATH_LEN`], fall
/// back to a short hash of `task_name` placed directly under the system
/// temp directory, which is assumed to always fit.
pub fn socket_path(dir: &std::path::Path, task_name: &str) -> std::path::PathBuf {
    let candidate = dir.join(format!("{task_name}.sock"));
    if candidate.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
        return candidate;
    }

    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(task_name.as_bytes());
    let digest = hasher.finalize();
    let short = hex_prefix(&digest, 16);

    let relocated = std::env::temp_dir().join(format!("{short}.sock"));
    debug_assert!(
        relocated.as_os_str().len() <= MAX_SOCKET_PATH_LEN,
        "hashed socket path must fit the limit it was relocated to satisfy"
    );
    relocated
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(chars)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_socket_path_short_passes_through() {
        let dir = std::path::Path::new("/tmp/flow");
        let path = socket_path(dir, "my-task");
        assert_eq!(path, std::path::Path::new("/tmp/flow/my-task.sock"));
    }

    #[test]
    fn test_socket_path_long_is_hashed_and_relocated() {
        let dir = std::path::Path::new("/tmp/flow/some/very/deeply/nested/build/directory");
        let long_name = "a".repeat(200);
        let path = socket_path(dir, &long_name);

        assert!(path.as_os_str().len() <= MAX_SOCKET_PATH_LEN);
        assert_eq!(path.parent().unwrap(), std::env::temp_dir());
    }
}
