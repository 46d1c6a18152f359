//! Runtime driver.
//!
//! Builds the argument vector for the selected runtime binary and executes
//! it in the foreground with inherited stdio. The container starts as root
//! and the generated entrypoint script performs the privilege drop; the
//! tool's exit code is the runtime child's, including 128+N for signals.

use std::io::Write as _;
use std::process::Command;

use ctenv_common::paths::find_in_path;
use ctenv_common::shell;
use ctenv_common::{CtenvError, CtenvResult};
use nix::unistd::Uid;

use crate::config::Runtime;
use crate::entrypoint;
use crate::spec::{gosu_volume, ContainerSpec};
use crate::ENTRYPOINT_MOUNT;

/// Invocation-level flags the driver needs besides the spec.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Print the assembled command instead of executing it.
    pub dry_run: bool,
    /// Mirror the tool's verbosity into the entrypoint script and dump the
    /// script before running.
    pub verbose: bool,
    /// Suppress non-essential output.
    pub quiet: bool,
}

/// Assemble the full runtime argument vector (program name first).
pub fn build_run_args(spec: &ContainerSpec, entrypoint_path: &str, rootless: bool) -> Vec<String> {
    let mut args = vec![
        spec.runtime.program().to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--init".to_string(),
        "--user=root".to_string(),
        format!("--name={}", spec.container_name),
    ];

    args.push(if spec.tty { "-it" } else { "-i" }.to_string());

    if spec.runtime == Runtime::Podman && rootless {
        args.push("--userns=keep-id".to_string());
    }
    if let Some(platform) = &spec.platform {
        args.push(format!("--platform={platform}"));
    }
    if let Some(network) = &spec.network {
        args.push(format!("--network={network}"));
    }
    for (name, value) in &spec.ulimits {
        args.push(format!("--ulimit={name}={value}"));
    }
    for volume in &spec.volumes {
        args.push(format!("--volume={}", volume.to_runtime_string()));
    }
    args.push(format!("--volume={}", gosu_volume(spec).to_runtime_string()));
    args.push(format!("--volume={entrypoint_path}:{ENTRYPOINT_MOUNT}:ro"));
    args.push(format!("--workdir={}", spec.workdir));
    for entry in &spec.env {
        args.push(format!("--env={entry}"));
    }
    args.push("--entrypoint=/bin/sh".to_string());
    for run_arg in &spec.run_args {
        args.push(run_arg.clone());
    }
    args.push("--label=se.osd.ctenv.managed=true".to_string());
    args.push(format!(
        "--label=se.osd.ctenv.version={}",
        env!("CARGO_PKG_VERSION")
    ));
    args.push(spec.image.clone());
    args.push(ENTRYPOINT_MOUNT.to_string());
    args
}

/// Whether this invocation drives a rootless podman.
fn is_rootless() -> bool {
    !Uid::effective().is_root()
}

/// Execute (or dry-run) the container, returning the exit code to
/// propagate.
pub fn run_container(spec: &ContainerSpec, opts: &RunOptions) -> CtenvResult<i32> {
    let program = find_in_path(spec.runtime.program()).ok_or_else(|| {
        CtenvError::RuntimeNotFound {
            runtime: spec.runtime.program().to_string(),
        }
    })?;
    tracing::debug!(program = %program.display(), "resolved container runtime");

    if !spec.gosu_path.is_file() {
        return Err(CtenvError::Path {
            path: spec.gosu_path.clone(),
            message: "gosu binary not found".to_string(),
        });
    }

    let script = entrypoint::render(spec, opts.verbose, opts.quiet)?;
    if opts.verbose {
        eprintln!("{}", "=".repeat(60));
        eprintln!(
            "Entrypoint script{}:",
            if opts.dry_run { " that would be executed" } else { "" }
        );
        eprintln!("{}", "=".repeat(60));
        eprintln!("{script}");
        eprintln!("{}", "=".repeat(60));
    }

    if opts.dry_run {
        let args = build_run_args(spec, "/tmp/ctenv-entrypoint.sh", is_rootless());
        println!("{}", shell::join(&args));
        return Ok(0);
    }

    // The temp file must outlive the child; RAII removes it on every exit
    // path, runtime failures included.
    let mut script_file = tempfile::Builder::new()
        .prefix("ctenv-entrypoint-")
        .suffix(".sh")
        .tempfile()
        .map_err(|source| CtenvError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
    script_file
        .write_all(script.as_bytes())
        .map_err(|source| CtenvError::Io {
            path: script_file.path().to_path_buf(),
            source,
        })?;
    script_file
        .as_file()
        .sync_all()
        .map_err(|source| CtenvError::Io {
            path: script_file.path().to_path_buf(),
            source,
        })?;
    set_world_readable(script_file.path())?;

    let script_path = script_file.path().to_string_lossy().into_owned();
    let args = build_run_args(spec, &script_path, is_rootless());
    tracing::debug!(command = %shell::join(&args), "executing container runtime");

    let status = Command::new(&program)
        .args(&args[1..])
        .status()
        .map_err(|source| CtenvError::Io {
            path: program,
            source,
        })?;

    Ok(exit_code(&status))
}

/// Map a child exit status to this process's exit code (128+N on signal).
pub fn exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

#[cfg(unix)]
fn set_world_readable(path: &std::path::Path) -> CtenvResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).map_err(|source| {
        CtenvError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_world_readable(_path: &std::path::Path) -> CtenvResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UlimitValue;
    use crate::volume::{ResolvedVolume, VolumeOption};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn test_spec() -> ContainerSpec {
        ContainerSpec {
            user_name: "alice".to_string(),
            user_id: 1234,
            user_home: PathBuf::from("/home/alice"),
            group_name: "alice".to_string(),
            group_id: 1234,
            image: "alpine:latest".to_string(),
            command: "id -u".to_string(),
            container_name: "ctenv-p-4242".to_string(),
            workdir: "/repo".to_string(),
            tty: false,
            sudo: false,
            network: None,
            platform: None,
            ulimits: BTreeMap::new(),
            env: Vec::new(),
            volumes: vec![ResolvedVolume {
                host: "/p".to_string(),
                container: "/repo".to_string(),
                options: Vec::new(),
            }],
            chown_paths: Vec::new(),
            post_start_commands: Vec::new(),
            run_args: Vec::new(),
            runtime: crate::config::Runtime::Docker,
            gosu_path: PathBuf::from("/opt/gosu"),
            build: None,
        }
    }

    #[test]
    fn arg_vector_shape() {
        let args = build_run_args(&test_spec(), "/tmp/e.sh", false);
        assert_eq!(args[0], "docker");
        assert_eq!(&args[1..6], ["run", "--rm", "--init", "--user=root", "--name=ctenv-p-4242"]);
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"--volume=/p:/repo".to_string()));
        assert!(args.contains(&"--volume=/opt/gosu:/ctenv/gosu:ro".to_string()));
        assert!(args.contains(&"--volume=/tmp/e.sh:/ctenv/entrypoint.sh:ro".to_string()));
        assert!(args.contains(&"--workdir=/repo".to_string()));
        assert!(args.contains(&"--entrypoint=/bin/sh".to_string()));
        assert!(args.contains(&"--label=se.osd.ctenv.managed=true".to_string()));
        // Image, then the script path as the sole command argument.
        assert_eq!(&args[args.len() - 2..], ["alpine:latest", "/ctenv/entrypoint.sh"]);
    }

    #[test]
    fn tty_switches_interactive_flags() {
        let mut spec = test_spec();
        spec.tty = true;
        let args = build_run_args(&spec, "/tmp/e.sh", false);
        assert!(args.contains(&"-it".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn rootless_podman_keeps_id() {
        let mut spec = test_spec();
        spec.runtime = crate::config::Runtime::Podman;
        let args = build_run_args(&spec, "/tmp/e.sh", true);
        assert_eq!(args[0], "podman");
        assert!(args.contains(&"--userns=keep-id".to_string()));

        let args = build_run_args(&spec, "/tmp/e.sh", false);
        assert!(!args.contains(&"--userns=keep-id".to_string()));

        // Rootful docker never gets the flag.
        let args = build_run_args(&test_spec(), "/tmp/e.sh", true);
        assert!(!args.contains(&"--userns=keep-id".to_string()));
    }

    #[test]
    fn optional_flags_appear_when_set() {
        let mut spec = test_spec();
        spec.platform = Some("linux/arm64".to_string());
        spec.network = Some("bridge".to_string());
        spec.ulimits
            .insert("nofile".to_string(), UlimitValue::Limit(1024));
        spec.ulimits.insert(
            "core".to_string(),
            UlimitValue::SoftHard("0:unlimited".to_string()),
        );
        spec.env = vec!["DEBUG=1".to_string(), "TERM".to_string()];
        spec.run_args = vec!["--privileged".to_string()];

        let args = build_run_args(&spec, "/tmp/e.sh", false);
        assert!(args.contains(&"--platform=linux/arm64".to_string()));
        assert!(args.contains(&"--network=bridge".to_string()));
        assert!(args.contains(&"--ulimit=nofile=1024".to_string()));
        assert!(args.contains(&"--ulimit=core=0:unlimited".to_string()));
        assert!(args.contains(&"--env=DEBUG=1".to_string()));
        assert!(args.contains(&"--env=TERM".to_string()));
        assert!(args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn chown_never_reaches_the_runtime() {
        let mut spec = test_spec();
        spec.volumes.push(ResolvedVolume {
            host: "cache".to_string(),
            container: "/var/cache".to_string(),
            options: vec![VolumeOption::Chown],
        });
        let args = build_run_args(&spec, "/tmp/e.sh", false);
        assert!(args.contains(&"--volume=cache:/var/cache".to_string()));
        assert!(!args.iter().any(|a| a.contains("chown")));
    }

    #[test]
    fn subpath_remap_arg_shape() {
        let mut spec = test_spec();
        spec.volumes.push(ResolvedVolume {
            host: "/p/src".to_string(),
            container: "/repo/src".to_string(),
            options: Vec::new(),
        });
        let args = build_run_args(&spec, "/tmp/e.sh", false);
        assert!(args.contains(&"--volume=/p/src:/repo/src".to_string()));
    }
}
