//! Spec resolution.
//!
//! Translates the merged, substituted [`ContainerConfig`] plus the
//! [`RuntimeContext`] into a [`ContainerSpec`]: no unset sentinels, no
//! unresolved variables, no relative paths. The runtime driver and the
//! entrypoint generator consume only this type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ctenv_common::paths::{descendant_of, find_in_path, relative_to};
use ctenv_common::{CtenvError, CtenvResult};

use crate::config::{ContainerConfig, Layered, Runtime, TtyMode, UlimitValue};
use crate::context::RuntimeContext;
use crate::template::slug;
use crate::volume::{ResolvedVolume, VolumeOption, VolumeSpec};
use crate::GOSU_MOUNT;

/// Build context after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildContext {
    /// A directory on disk.
    Dir(PathBuf),
    /// No context at all; the driver fabricates an empty temp directory.
    Empty,
}

/// Fully-resolved image build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Dockerfile path (exclusive with `dockerfile_content`).
    pub dockerfile: Option<PathBuf>,
    /// Inline dockerfile content (exclusive with `dockerfile`).
    pub dockerfile_content: Option<String>,
    /// Build context.
    pub context: BuildContext,
    /// Tag for the built image; also the image the run uses.
    pub tag: String,
    /// Build arguments.
    pub args: BTreeMap<String, String>,
    /// Target platform, when pinned.
    pub platform: Option<String>,
}

/// The fully-resolved, ready-to-execute container specification.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Target user name inside the container.
    pub user_name: String,
    /// Target uid.
    pub user_id: u32,
    /// Target home directory.
    pub user_home: PathBuf,
    /// Target group name.
    pub group_name: String,
    /// Target gid.
    pub group_id: u32,

    /// Image reference (the build tag when a build is requested).
    pub image: String,
    /// Shell-interpretable command string.
    pub command: String,
    /// Container name, unique per invocation by default.
    pub container_name: String,
    /// In-container working directory, absolute.
    pub workdir: String,
    /// Whether to allocate a TTY.
    pub tty: bool,
    /// Whether to install sudo for the target user.
    pub sudo: bool,

    /// Runtime network, when set.
    pub network: Option<String>,
    /// Platform, when set.
    pub platform: Option<String>,
    /// Resource limits.
    pub ulimits: BTreeMap<String, UlimitValue>,
    /// `NAME=VALUE` and passthrough `NAME` entries, in order.
    pub env: Vec<String>,
    /// All volume mounts after remapping, project mount first.
    pub volumes: Vec<ResolvedVolume>,
    /// Container paths to chown to the target user, absolute.
    pub chown_paths: Vec<String>,
    /// Commands run as root after setup.
    pub post_start_commands: Vec<String>,
    /// Verbatim extra runtime arguments.
    pub run_args: Vec<String>,
    /// Which runtime binary drives this.
    pub runtime: Runtime,

    /// Host path of the privilege-drop helper, mounted at [`GOSU_MOUNT`].
    pub gosu_path: PathBuf,
    /// Build request, executed before the run when present.
    pub build: Option<BuildSpec>,
}

/// Resolve the merged record into an executable spec.
pub fn resolve(config: &ContainerConfig, ctx: &RuntimeContext) -> CtenvResult<ContainerSpec> {
    let project_dir = match config.project_dir.value() {
        Some(dir) => PathBuf::from(dir),
        None => ctx.project_dir.clone(),
    };

    let (target_path, target_options) = resolve_project_target(config, &project_dir)?;

    let auto_project_mount = config.auto_project_mount.value().copied().unwrap_or(true);
    let subpaths = config.subpaths.value().cloned().unwrap_or_default();

    let mut volumes: Vec<ResolvedVolume> = Vec::new();
    let mut chown_paths: Vec<String> = Vec::new();

    if auto_project_mount {
        if !subpaths.is_empty() {
            tracing::warn!(
                "subpaths are ignored while auto_project_mount is enabled; \
                 disable it with --no-auto-project-mount to mount subpaths only"
            );
        }
        require_dir(&project_dir, "project directory")?;
        push_volume(
            ResolvedVolume {
                host: project_dir.to_string_lossy().into_owned(),
                container: target_path.clone(),
                options: target_options.clone(),
            },
            &mut volumes,
            &mut chown_paths,
        )?;
    } else {
        for subpath in &subpaths {
            let spec = VolumeSpec::parse(subpath)?;
            let host = PathBuf::from(&spec.host);
            if !host.exists() {
                return Err(CtenvError::Path {
                    path: host,
                    message: "subpath does not exist".to_string(),
                });
            }
            let rel = relative_to(&host, &project_dir).ok_or_else(|| CtenvError::Path {
                path: host.clone(),
                message: format!(
                    "subpath must be inside the project directory {}",
                    project_dir.display()
                ),
            })?;
            let container = match &spec.container {
                Some(c) => c.clone(),
                None => join_container_path(&target_path, &rel),
            };
            push_volume(
                ResolvedVolume {
                    host: spec.host.clone(),
                    container,
                    options: spec.options.clone(),
                },
                &mut volumes,
                &mut chown_paths,
            )?;
        }
    }

    for vol_str in config.volumes.value().cloned().unwrap_or_default() {
        let spec = VolumeSpec::parse(&vol_str)?;
        let container = match &spec.container {
            Some(c) => c.clone(),
            None => {
                let host = Path::new(&spec.host);
                if host.is_absolute() {
                    match relative_to(host, &project_dir) {
                        // Project-relative hosts follow the project mount.
                        Some(rel) if descendant_of(host, &project_dir) => {
                            join_container_path(&target_path, &rel)
                        }
                        _ => spec.host.clone(),
                    }
                } else {
                    // Named volume without a target: identity.
                    spec.host.clone()
                }
            }
        };
        push_volume(
            ResolvedVolume {
                host: spec.host.clone(),
                container,
                options: spec.options.clone(),
            },
            &mut volumes,
            &mut chown_paths,
        )?;
    }

    let workdir = resolve_workdir(config, ctx, &project_dir, &target_path)?;
    if !volumes
        .iter()
        .any(|v| descendant_of(Path::new(&workdir), Path::new(&v.container)))
    {
        tracing::warn!(
            workdir = %workdir,
            "working directory is not under any mount point"
        );
    }

    let platform = layered_opt(&config.platform);
    let gosu_path = resolve_gosu(config, ctx, platform.as_deref())?;

    let container_name = match config.container_name.value() {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("ctenv-{}-{}", slug(&project_dir.to_string_lossy()), ctx.pid),
    };

    let tty = match config.tty.value() {
        Some(TtyMode::Yes) => true,
        Some(TtyMode::No) => false,
        Some(TtyMode::Auto) | None => ctx.tty,
    };

    let build = resolve_build(config, &project_dir, platform.clone())?;
    let image = match &build {
        Some(build) => build.tag.clone(),
        None => config
            .image
            .value()
            .cloned()
            .ok_or_else(|| CtenvError::Config {
                message: "no image configured and no build section present".to_string(),
            })?,
    };

    Ok(ContainerSpec {
        user_name: ctx.user_name.clone(),
        user_id: ctx.user_id,
        user_home: ctx.user_home.clone(),
        group_name: ctx.group_name.clone(),
        group_id: ctx.group_id,
        image,
        command: config.command.value().cloned().unwrap_or_else(|| "bash".to_string()),
        container_name,
        workdir,
        tty,
        sudo: config.sudo.value().copied().unwrap_or(false),
        network: layered_opt(&config.network),
        platform,
        ulimits: config.ulimits.value().cloned().unwrap_or_default(),
        env: config.env.value().cloned().unwrap_or_default(),
        volumes,
        chown_paths,
        post_start_commands: config.post_start_commands.value().cloned().unwrap_or_default(),
        run_args: config.run_args.value().cloned().unwrap_or_default(),
        runtime: config.runtime.value().copied().unwrap_or(Runtime::Docker),
        gosu_path,
        build,
    })
}

fn layered_opt(field: &Layered<String>) -> Option<String> {
    field.value().cloned()
}

fn require_dir(path: &Path, what: &str) -> CtenvResult<()> {
    if !path.is_dir() {
        return Err(CtenvError::Path {
            path: path.to_path_buf(),
            message: format!("{what} does not exist or is not a directory"),
        });
    }
    Ok(())
}

/// Record a resolved volume, extracting any chown request. Chown targets
/// must be absolute container paths; anything else would chown a relative
/// location inside the entrypoint's cwd.
fn push_volume(
    volume: ResolvedVolume,
    volumes: &mut Vec<ResolvedVolume>,
    chown_paths: &mut Vec<String>,
) -> CtenvResult<()> {
    if volume.options.contains(&VolumeOption::Chown) {
        if !volume.container.starts_with('/') {
            return Err(CtenvError::Path {
                path: PathBuf::from(&volume.container),
                message: "chown requires an absolute container path".to_string(),
            });
        }
        chown_paths.push(volume.container.clone());
    }
    volumes.push(volume);
    Ok(())
}

/// Parse `project_target` (`PATH[:OPTS]`), defaulting to an identity mount
/// of the project directory.
fn resolve_project_target(
    config: &ContainerConfig,
    project_dir: &Path,
) -> CtenvResult<(String, Vec<VolumeOption>)> {
    let raw = match config.project_target.value() {
        Some(raw) => raw.clone(),
        None => return Ok((project_dir.to_string_lossy().into_owned(), Vec::new())),
    };
    let (path, opts_str) = match raw.split_once(':') {
        Some((p, o)) => (p.to_string(), o.to_string()),
        None => (raw.clone(), String::new()),
    };
    if !path.starts_with('/') {
        return Err(CtenvError::Path {
            path: PathBuf::from(&path),
            message: "project_target must be an absolute in-container path".to_string(),
        });
    }
    let mut options = Vec::new();
    for opt in opts_str.split(',') {
        let opt = opt.trim();
        if opt.is_empty() {
            continue;
        }
        match opt {
            "ro" => options.push(VolumeOption::ReadOnly),
            "rw" => options.push(VolumeOption::ReadWrite),
            "z" => options.push(VolumeOption::SharedRelabel),
            "Z" => options.push(VolumeOption::PrivateRelabel),
            "chown" => options.push(VolumeOption::Chown),
            other => {
                return Err(CtenvError::VolumeSyntax {
                    spec: raw.clone(),
                    reason: format!("unknown option '{other}'"),
                })
            }
        }
    }
    Ok((path, options))
}

fn join_container_path(target: &str, rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        return target.to_string();
    }
    let mut out = target.trim_end_matches('/').to_string();
    out.push('/');
    out.push_str(&rel.to_string_lossy());
    out
}

/// `"auto"` preserves the cwd's position relative to the project dir;
/// explicit values must be absolute in-container paths.
fn resolve_workdir(
    config: &ContainerConfig,
    ctx: &RuntimeContext,
    project_dir: &Path,
    target_path: &str,
) -> CtenvResult<String> {
    match config.workdir.value() {
        None => Ok(target_path.to_string()),
        Some(w) if w == "auto" => {
            if let Some(rel) = relative_to(&ctx.cwd, project_dir) {
                Ok(join_container_path(target_path, &rel))
            } else {
                Ok(target_path.to_string())
            }
        }
        Some(w) => {
            if !w.starts_with('/') {
                return Err(CtenvError::Path {
                    path: PathBuf::from(w),
                    message: "workdir must be an absolute in-container path or \"auto\""
                        .to_string(),
                });
            }
            Ok(w.clone())
        }
    }
}

/// Map a runtime platform string to a gosu architecture suffix.
fn platform_arch(platform: Option<&str>) -> &'static str {
    match platform {
        Some("linux/amd64") => "amd64",
        Some("linux/arm64") => "arm64",
        Some(_) => "amd64",
        None => host_arch(),
    }
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => "amd64",
    }
}

/// Select the privilege-drop helper binary.
///
/// `"auto"` looks for a bundled `binaries/gosu-<arch>` next to the
/// executable, then under `~/.ctenv/binaries/`, then (host-arch targets
/// only) a `gosu` on PATH. Explicit paths must exist.
fn resolve_gosu(
    config: &ContainerConfig,
    ctx: &RuntimeContext,
    platform: Option<&str>,
) -> CtenvResult<PathBuf> {
    match config.gosu_path.value() {
        Some(path) if path != "auto" => {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(CtenvError::Path {
                    path,
                    message: "gosu binary not found".to_string(),
                });
            }
            Ok(path)
        }
        _ => {
            let arch = platform_arch(platform);
            let binary_name = format!("gosu-{arch}");
            let mut candidates: Vec<PathBuf> = Vec::new();
            if let Ok(exe) = std::env::current_exe() {
                if let Some(dir) = exe.parent() {
                    candidates.push(dir.join("binaries").join(&binary_name));
                }
            }
            candidates.push(ctx.user_home.join(".ctenv/binaries").join(&binary_name));

            for candidate in &candidates {
                if candidate.is_file() {
                    return Ok(candidate.clone());
                }
            }
            if arch == host_arch() {
                if let Some(found) = find_in_path("gosu") {
                    return Ok(found);
                }
            }
            Err(CtenvError::Path {
                path: PathBuf::from(binary_name),
                message: format!(
                    "gosu binary not found (searched {})",
                    candidates
                        .iter()
                        .map(|c| c.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
        }
    }
}

/// The gosu volume mount for the runtime driver.
pub fn gosu_volume(spec: &ContainerSpec) -> ResolvedVolume {
    ResolvedVolume {
        host: spec.gosu_path.to_string_lossy().into_owned(),
        container: GOSU_MOUNT.to_string(),
        options: vec![VolumeOption::ReadOnly],
    }
}

fn resolve_build(
    config: &ContainerConfig,
    project_dir: &Path,
    platform: Option<String>,
) -> CtenvResult<Option<BuildSpec>> {
    let Some(build) = config.build.value() else {
        return Ok(None);
    };

    let dockerfile = build.dockerfile.value().map(PathBuf::from);
    let dockerfile_content = build.dockerfile_content.value().cloned();
    match (&dockerfile, &dockerfile_content) {
        (Some(_), Some(_)) => {
            return Err(CtenvError::Config {
                message: "build 'dockerfile' and 'dockerfile_content' are mutually exclusive"
                    .to_string(),
            })
        }
        (None, None) => {
            return Err(CtenvError::Config {
                message: "build requires 'dockerfile' or 'dockerfile_content'".to_string(),
            })
        }
        _ => {}
    }

    if let Some(path) = &dockerfile {
        if !path.is_file() {
            return Err(CtenvError::Path {
                path: path.clone(),
                message: "dockerfile does not exist".to_string(),
            });
        }
    }
    if let Some(content) = &dockerfile_content {
        if content.trim().is_empty() {
            return Err(CtenvError::Config {
                message: "build 'dockerfile_content' is empty".to_string(),
            });
        }
    }

    let context = match build.context.value().map(String::as_str) {
        Some("-") => BuildContext::Empty,
        Some(dir) => {
            let dir = PathBuf::from(dir);
            require_dir(&dir, "build context")?;
            BuildContext::Dir(dir)
        }
        None => {
            require_dir(project_dir, "build context")?;
            BuildContext::Dir(project_dir.to_path_buf())
        }
    };

    let tag = match build.tag.value() {
        Some(tag) => tag.clone(),
        None => format!("ctenv-{}", slug(&project_dir.to_string_lossy()).to_lowercase()),
    };

    Ok(Some(BuildSpec {
        dockerfile,
        dockerfile_content,
        context,
        tag,
        args: build.args.value().cloned().unwrap_or_default(),
        platform,
    }))
}
