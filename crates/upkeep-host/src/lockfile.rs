//! ---
//! upkeep_section: "02-host-inspection"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Process table, signalling, and resource sampling."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Whether some open file description currently holds an exclusive flock on `path`.
///
/// Probing takes and immediately drops the lock when it is free.
#[cfg(unix)]
pub fn is_flock_held(path: &Path) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let file = OpenOptions::new().read(true).open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => {
            drop(guard);
            Ok(false)
        }
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(true),
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn is_flock_held(path: &Path) -> io::Result<bool> {
    OpenOptions::new().read(true).open(path).map(|_| false)
}
