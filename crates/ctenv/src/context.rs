//! Runtime context capture.
//!
//! A single immutable snapshot of the invoking host environment, taken once
//! per invocation. Everything downstream (merging, templating, resolution)
//! reads from this instead of poking at the process environment.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use ctenv_common::{CtenvError, CtenvResult};
use nix::unistd::{Gid, Group, Uid, User};

use crate::CONFIG_FILE_NAME;

/// Snapshot of host identity and invocation state.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// Host user name.
    pub user_name: String,
    /// Host uid.
    pub user_id: u32,
    /// Host home directory.
    pub user_home: PathBuf,
    /// Host primary group name.
    pub group_name: String,
    /// Host primary gid.
    pub group_id: u32,
    /// Working directory at invocation.
    pub cwd: PathBuf,
    /// Project directory (explicit or auto-detected, falling back to cwd).
    pub project_dir: PathBuf,
    /// This process's pid, embedded in default container names.
    pub pid: u32,
    /// Whether stdin is attached to a terminal.
    pub tty: bool,
}

impl RuntimeContext {
    /// Capture the current runtime context.
    ///
    /// When `project_dir` is not supplied, it is auto-detected by walking
    /// ancestors of the cwd for a `.ctenv.toml`, stopping at (and never
    /// entering) the home directory and never crossing filesystem mount
    /// boundaries; the cwd itself is the fallback.
    pub fn capture(project_dir: Option<PathBuf>) -> CtenvResult<Self> {
        let uid = Uid::current();
        let gid = Gid::current();

        let user = User::from_uid(uid)
            .map_err(|e| CtenvError::Identity {
                message: format!("passwd lookup for uid {uid} failed: {e}"),
            })?
            .ok_or_else(|| CtenvError::Identity {
                message: format!("no passwd entry for uid {uid}"),
            })?;
        let group = Group::from_gid(gid)
            .map_err(|e| CtenvError::Identity {
                message: format!("group lookup for gid {gid} failed: {e}"),
            })?
            .ok_or_else(|| CtenvError::Identity {
                message: format!("no group entry for gid {gid}"),
            })?;

        // $HOME wins over the passwd entry so that overridden homes
        // resolve and stop discovery the way the shell sees them.
        let user_home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user.dir.clone());

        let cwd = std::env::current_dir().map_err(|source| CtenvError::Io {
            path: PathBuf::from("."),
            source,
        })?;

        let project_dir = match project_dir {
            Some(dir) => {
                let dir = if dir.is_absolute() { dir } else { cwd.join(dir) };
                ctenv_common::paths::normalize(&dir)
            }
            None => find_project_dir(&cwd, &user_home).unwrap_or_else(|| cwd.clone()),
        };

        Ok(Self {
            user_name: user.name,
            user_id: uid.as_raw(),
            user_home,
            group_name: group.name,
            group_id: gid.as_raw(),
            cwd,
            project_dir,
            pid: std::process::id(),
            tty: std::io::stdin().is_terminal(),
        })
    }
}

/// Find the nearest ancestor of `start` (inclusive) that contains a
/// `.ctenv.toml`, without entering `home` and without crossing a
/// filesystem mount boundary.
pub fn find_project_dir(start: &Path, home: &Path) -> Option<PathBuf> {
    find_project_config(start, home).and_then(|p| p.parent().map(Path::to_path_buf))
}

/// Find the nearest project config file itself; shared with the loader's
/// discovery step.
pub fn find_project_config(start: &Path, home: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    let mut device = device_of(&current);
    loop {
        if current == home {
            // The home-level file is the user-scope config, not a project.
            return None;
        }
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        let parent = current.parent()?.to_path_buf();
        if parent == current {
            return None;
        }
        let parent_device = device_of(&parent);
        if device.is_some() && parent_device.is_some() && device != parent_device {
            // Mount boundary.
            return None;
        }
        device = parent_device;
        current = parent;
    }
}

#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    path.metadata().ok().map(|m| m.dev())
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn project_config_found_in_ancestor() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        std::fs::write(root.join(CONFIG_FILE_NAME), "").unwrap();
        let nested = root.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let home = root.join("nonexistent-home");
        let found = find_project_config(&nested, &home).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE_NAME));
        assert_eq!(find_project_dir(&nested, &home).unwrap(), root);
    }

    #[test]
    fn walk_stops_at_home() {
        let temp = tempdir().unwrap();
        let home = temp.path().to_path_buf();
        std::fs::write(home.join(CONFIG_FILE_NAME), "").unwrap();
        let nested = home.join("projects/app");
        std::fs::create_dir_all(&nested).unwrap();

        // The file in $HOME is user-scope config, not a project marker.
        assert_eq!(find_project_config(&nested, &home), None);
    }

    #[test]
    fn no_config_yields_none() {
        let temp = tempdir().unwrap();
        let nested = temp.path().join("x/y");
        std::fs::create_dir_all(&nested).unwrap();
        let home = temp.path().join("elsewhere");
        // Walk may continue above the tempdir; /tmp has no .ctenv.toml in
        // any sane test environment, but the mount-boundary stop also
        // bounds the search.
        let found = find_project_config(&nested, &home);
        assert!(found.is_none() || !found.unwrap().starts_with(temp.path()));
    }
}
