use std::path::Path;

use clause_core::instance::{ContainerSpec, Owner};
use tracing::{info, warn};

/// Identity of this process, used as the default container user.
pub fn host_owner() -> Owner {
    Owner {
        uid: rustix::process::geteuid().as_raw(),
        gid: rustix::process::getegid().as_raw(),
    }
}

/// Make sure every bind-mount source exists and is owned by the identity
/// the container will run as.
///
/// Without this the engine creates missing sources as root, and files the
/// interpreter writes end up unreadable for the host user.
pub fn prepare_mounts(spec: &ContainerSpec) -> std::io::Result<()> {
    let running_as_root = rustix::process::geteuid().is_root();
    for mount in &spec.mounts {
        std::fs::create_dir_all(&mount.host_path)?;
        for sub in ["knowledge", "notebooks"] {
            std::fs::create_dir_all(mount.host_path.join(sub))?;
        }
        if let Some(owner) = spec.owner {
            align_owner(&mount.host_path, owner, running_as_root)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn align_owner(path: &Path, owner: Owner, running_as_root: bool) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)?;
    if meta.uid() == owner.uid && meta.gid() == owner.gid {
        return Ok(());
    }
    if running_as_root {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
        info!(
            path = %path.display(),
            uid = owner.uid,
            gid = owner.gid,
            "aligned mount ownership"
        );
    } else {
        warn!(
            path = %path.display(),
            have_uid = meta.uid(),
            want_uid = owner.uid,
            "mount directory owned by another user; container writes may fail"
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn align_owner(_path: &Path, _owner: Owner, _running_as_root: bool) -> std::io::Result<()> {
    Ok(())
}
