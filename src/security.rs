#![forbid(unsafe_code)]

//! Startup guard shared by the vidfetch binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start when invoked as root. The service only ever needs to
/// write inside its download directory, so an unprivileged account is the
/// right place for it to live.
pub fn ensure_unprivileged(process: &str) -> Result<()> {
    ensure_unprivileged_for(Uid::current(), process)
}

fn ensure_unprivileged_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; start it under a regular service account");
    }
    Ok(())
}
