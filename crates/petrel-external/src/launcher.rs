//! Helper binary location and IPC child launch.
//!
//! Helpers are located on a configurable search path, validated against
//! the current uid/gid, and spawned with the channel pipe descriptors
//! injected as `--in-fd`/`--out-fd` arguments.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use nix::sys::signal::SigSet;
use nix::unistd::{getgid, getgroups, getuid};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::ExternalConfig;
use crate::error::{EndpointError, LaunchStage};
use crate::transport::{pipe_transport, TransportReader, TransportWriter};

/// A spawned helper with the parent's channel endpoints.
pub struct LaunchedWorker {
    pub pid: i32,
    pub child: Child,
    pub reader: TransportReader,
    pub writer: TransportWriter,
}

impl std::fmt::Debug for LaunchedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedWorker")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Checks whether a helper binary exists on the search path and carries
/// the owner-execute bit.
#[must_use]
pub fn check_ipc(config: &ExternalConfig, binary: &str) -> bool {
    resolve_binary(config, binary).is_ok()
}

/// Locates a helper binary on the configured search path.
///
/// Directories are skipped; the first regular file with the
/// owner-execute bit wins. The winner is then validated against the
/// current uid/gid.
pub fn resolve_binary(config: &ExternalConfig, binary: &str) -> Result<PathBuf, EndpointError> {
    let templates = if config.helper_binary_path.is_empty() {
        vec!["%B".to_owned()]
    } else {
        config.helper_binary_path.clone()
    };

    for template in &templates {
        let candidate = config.expand_search_path(template).join(binary);

        let Ok(meta) = std::fs::metadata(&candidate) else {
            continue;
        };

        if meta.is_dir() {
            continue;
        }

        if meta.mode() & 0o100 != 0 {
            check_exec_permissions(&candidate, &meta)?;
            return Ok(candidate);
        }
    }

    Err(EndpointError::launch(
        LaunchStage::MissingBinary,
        format!("cannot find helper binary for launch: {binary}"),
    ))
}

/// Verifies the current process may execute a resolved helper.
///
/// World-executable files always pass. Otherwise the uid must match the
/// file owner (or be root), or the file's group must be the process gid
/// or one of its supplementary groups.
fn check_exec_permissions(
    path: &std::path::Path,
    meta: &std::fs::Metadata,
) -> Result<(), EndpointError> {
    if meta.mode() & 0o001 != 0 {
        return Ok(());
    }

    let uid = getuid();
    if uid.is_root() || uid.as_raw() == meta.uid() {
        return Ok(());
    }

    if getgid().as_raw() == meta.gid() {
        return Ok(());
    }

    let supplementary = getgroups().unwrap_or_default();
    if supplementary.iter().any(|g| g.as_raw() == meta.gid()) {
        return Ok(());
    }

    Err(EndpointError::launch(
        LaunchStage::Permissions,
        format!(
            "cannot run binary '{}', the daemon was installed setgid and the current user is \
             not in that group. If the user was recently added to the group, log out and back \
             in to activate it; check memberships with the 'groups' command",
            path.display()
        ),
    ))
}

/// Spawns a helper with the channel pipes wired up.
///
/// Creates two pipes (`in`: parent→child, `out`: child→parent), spawns
/// the helper with `--in-fd`/`--out-fd` pointing at its ends, and wraps
/// the parent's ends as transport halves. Before exec the child unblocks
/// all signals, so nothing carries over from the daemon's signal setup,
/// and closes its inherited copies of the parent's pipe ends.
///
/// Must be called from within a tokio runtime (the pipe halves register
/// with the reactor).
pub fn launch_worker(
    config: &ExternalConfig,
    binary: &str,
    args: &[String],
) -> Result<LaunchedWorker, EndpointError> {
    let path = resolve_binary(config, binary)?;

    // in: parent writes, child reads. out: child writes, parent reads.
    let (in_read, in_write) = create_pipe()?;
    let (out_read, out_write) = create_pipe()?;

    let mut cmd = Command::new(&path);
    cmd.arg(format!("--in-fd={}", in_read.as_raw_fd()))
        .arg(format!("--out-fd={}", out_write.as_raw_fd()))
        .args(args);

    // The pipes are inherited without close-on-exec, so the child must
    // drop its copies of the parent's ends or EOF never propagates.
    let parent_write_fd = in_write.as_raw_fd();
    let parent_read_fd = out_read.as_raw_fd();

    unsafe {
        cmd.pre_exec(move || {
            SigSet::all()
                .thread_unblock()
                .map_err(std::io::Error::from)?;
            nix::unistd::close(parent_write_fd).map_err(std::io::Error::from)?;
            nix::unistd::close(parent_read_fd).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| EndpointError::launch(LaunchStage::Spawn, e.to_string()))?;

    // Drop the parent's copies of the child's ends.
    drop(in_read);
    drop(out_write);

    #[allow(clippy::as_conversions)]
    let pid = child.id().map_or(-1, |id| id as i32);

    debug!(helper = %path.display(), pid, "Launched helper binary");

    let (reader, writer) = pipe_transport(out_read, in_write)
        .map_err(|e| EndpointError::launch(LaunchStage::Pipe, e.to_string()))?;

    Ok(LaunchedWorker {
        pid,
        child,
        reader,
        writer,
    })
}

fn create_pipe() -> Result<(OwnedFd, OwnedFd), EndpointError> {
    nix::unistd::pipe().map_err(|e| {
        EndpointError::launch(LaunchStage::Pipe, format!("could not create pipe: {e}"))
    })
}
