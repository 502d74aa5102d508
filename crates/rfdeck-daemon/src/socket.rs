use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{info, warn};

/// Binds the control socket, replacing a stale socket file left by a
/// previous run but never a live one or a non-socket path.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        if let Err(err) = fs::set_permissions(parent, fs::Permissions::from_mode(0o770)) {
            warn!(
                "failed to set socket directory permissions on {}: {}",
                parent.display(),
                err
            );
        }
    }
    if fs::symlink_metadata(path).is_ok() {
        cleanup_stale_socket(path)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    listener.set_nonblocking(true)?;
    info!("listening on unix socket: {}", path.display());
    UnixListener::from_std(listener)
}

fn cleanup_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "refusing to overwrite non-socket path at {}",
                path.display()
            ),
        ));
    }

    match UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("socket {} is already active", path.display()),
        )),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            fs::remove_file(path)?;
            Ok(())
        }
        Err(err) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "socket {} exists and could not be validated as stale: {}",
                path.display(),
                err
            ),
        )),
    }
}
