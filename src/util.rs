// Small filesystem helpers for the on-disk caches.

use std::io;
use std::path::PathBuf;

/// Resolves the user's home directory from the environment.
pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Returns `~/.tmqdevice/<sub>`, creating it if needed.
pub(crate) fn app_dir(sub: &str) -> io::Result<PathBuf> {
    let home = home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no home directory in environment")
    })?;
    let dir = home.join(format!(".{}", crate::PROGRAM_NAME)).join(sub);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
