//! Configuration layer records and merging.
//!
//! Every field of a layer is a [`Layered`] value with three states: unset
//! (the layer did not speak to this field), null (the layer explicitly
//! cleared it, written as the string `"NOTSET"`), or a concrete value.
//! Merging walks layers lowest to highest and lets anything that is not
//! unset overwrite the accumulated value. There is no deep merge and no
//! list concatenation.

pub mod file;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;

pub use file::{ConfigFile, CtenvConfig};

/// Sentinel string that parses to [`Layered::Null`] at any scalar position.
pub const NOTSET: &str = "NOTSET";

/// A configuration field with layer semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layered<T> {
    /// This layer did not mention the field.
    Unset,
    /// This layer explicitly cleared the field (`"NOTSET"`).
    Null,
    /// This layer set the field.
    Value(T),
}

impl<T> Layered<T> {
    /// Whether this is the unset sentinel.
    pub fn is_unset(&self) -> bool {
        matches!(self, Layered::Unset)
    }

    /// The concrete value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Layered::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Consume into the concrete value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Layered::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Layer `higher` over `self`: anything not unset wins, including an
    /// explicit null.
    pub fn merge_over(self, higher: Self) -> Self {
        match higher {
            Layered::Unset => self,
            other => other,
        }
    }

    /// Map the concrete value, preserving unset/null.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Layered<U> {
        match self {
            Layered::Unset => Layered::Unset,
            Layered::Null => Layered::Null,
            Layered::Value(v) => Layered::Value(f(v)),
        }
    }

    /// Map the concrete value fallibly, preserving unset/null.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Layered<U>, E> {
        Ok(match self {
            Layered::Unset => Layered::Unset,
            Layered::Null => Layered::Null,
            Layered::Value(v) => Layered::Value(f(v)?),
        })
    }
}

impl<T> Default for Layered<T> {
    fn default() -> Self {
        Layered::Unset
    }
}

impl<T> From<Option<T>> for Layered<T> {
    /// CLI conversion: an absent flag is unset, a present one is a value.
    fn from(opt: Option<T>) -> Self {
        match opt {
            None => Layered::Unset,
            Some(v) => Layered::Value(v),
        }
    }
}

impl Layered<String> {
    /// CLI conversion for string-valued flags, honoring the `"NOTSET"`
    /// literal.
    pub fn from_cli(opt: Option<String>) -> Self {
        match opt {
            None => Layered::Unset,
            Some(s) if s == NOTSET => Layered::Null,
            Some(s) => Layered::Value(s),
        }
    }
}

/// The container runtime to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Runtime {
    /// Docker CLI.
    Docker,
    /// Podman CLI.
    Podman,
}

impl Runtime {
    /// The binary name to look up on PATH.
    pub fn program(&self) -> &'static str {
        match self {
            Runtime::Docker => "docker",
            Runtime::Podman => "podman",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// TTY allocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TtyMode {
    /// Follow whether stdin is a terminal.
    Auto,
    /// Always allocate.
    Yes,
    /// Never allocate.
    No,
}

impl fmt::Display for TtyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TtyMode::Auto => "auto",
            TtyMode::Yes => "yes",
            TtyMode::No => "no",
        };
        f.write_str(s)
    }
}

/// A ulimit value: a single soft limit or a `soft:hard` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UlimitValue {
    /// Single numeric limit.
    Limit(i64),
    /// `soft:hard` pair, kept verbatim for the runtime.
    SoftHard(String),
}

impl fmt::Display for UlimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UlimitValue::Limit(n) => write!(f, "{n}"),
            UlimitValue::SoftHard(s) => f.write_str(s),
        }
    }
}

/// Image build settings within a layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildConfig {
    /// Path to a dockerfile, relative to the layer's origin.
    pub dockerfile: Layered<String>,
    /// Inline dockerfile content.
    pub dockerfile_content: Layered<String>,
    /// Build context directory; `"-"` means an empty context.
    pub context: Layered<String>,
    /// Image tag; defaults to one derived from the project slug.
    pub tag: Layered<String>,
    /// Build arguments.
    pub args: Layered<BTreeMap<String, String>>,
}

impl BuildConfig {
    /// Layer `higher` over `self`, field by field.
    pub fn merge_over(self, higher: Self) -> Self {
        Self {
            dockerfile: self.dockerfile.merge_over(higher.dockerfile),
            dockerfile_content: self.dockerfile_content.merge_over(higher.dockerfile_content),
            context: self.context.merge_over(higher.context),
            tag: self.tag.merge_over(higher.tag),
            args: self.args.merge_over(higher.args),
        }
    }
}

/// One configuration layer, produced by a config file section, the CLI, or
/// the built-in defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerConfig {
    /// Image reference; mutually exclusive with `build` within one layer.
    pub image: Layered<String>,
    /// Shell-interpretable command string.
    pub command: Layered<String>,
    /// Project directory override.
    pub project_dir: Layered<String>,
    /// In-container mount point for the project dir, `PATH[:OPTS]`.
    pub project_target: Layered<String>,
    /// Whether to auto-mount the project dir.
    pub auto_project_mount: Layered<bool>,
    /// Volume specs mounted instead of the whole project when the
    /// auto-mount is off.
    pub subpaths: Layered<Vec<String>>,
    /// `"auto"` preserves the host-relative cwd, else an absolute
    /// in-container path.
    pub workdir: Layered<String>,
    /// Privilege-drop helper path, or `"auto"` for the bundled binary.
    pub gosu_path: Layered<String>,
    /// Container name template.
    pub container_name: Layered<String>,
    /// TTY allocation.
    pub tty: Layered<TtyMode>,
    /// Install sudo and NOPASSWD the target user.
    pub sudo: Layered<bool>,
    /// Runtime network (`none`, `bridge`, a named network).
    pub network: Layered<String>,
    /// Platform, e.g. `linux/amd64`.
    pub platform: Layered<String>,
    /// Resource limits.
    pub ulimits: Layered<BTreeMap<String, UlimitValue>>,
    /// `NAME=VALUE` or passthrough `NAME` entries.
    pub env: Layered<Vec<String>>,
    /// Additional volume specs.
    pub volumes: Layered<Vec<String>>,
    /// Commands run as root after setup, before the privilege drop.
    pub post_start_commands: Layered<Vec<String>>,
    /// Arguments appended to the runtime invocation verbatim.
    pub run_args: Layered<Vec<String>>,
    /// Runtime selection.
    pub runtime: Layered<Runtime>,
    /// Image build settings.
    pub build: Layered<BuildConfig>,
    /// Marks this named container as the one used when none is named.
    pub default: Layered<bool>,
    /// Origin of this layer; metadata, never merged.
    pub config_file_path: Option<PathBuf>,
}

impl ContainerConfig {
    /// Layer `higher` over `self`, field by field. The result keeps the
    /// higher layer's origin metadata when it has one.
    pub fn merge_over(self, higher: Self) -> Self {
        Self {
            image: self.image.merge_over(higher.image),
            command: self.command.merge_over(higher.command),
            project_dir: self.project_dir.merge_over(higher.project_dir),
            project_target: self.project_target.merge_over(higher.project_target),
            auto_project_mount: self.auto_project_mount.merge_over(higher.auto_project_mount),
            subpaths: self.subpaths.merge_over(higher.subpaths),
            workdir: self.workdir.merge_over(higher.workdir),
            gosu_path: self.gosu_path.merge_over(higher.gosu_path),
            container_name: self.container_name.merge_over(higher.container_name),
            tty: self.tty.merge_over(higher.tty),
            sudo: self.sudo.merge_over(higher.sudo),
            network: self.network.merge_over(higher.network),
            platform: self.platform.merge_over(higher.platform),
            ulimits: self.ulimits.merge_over(higher.ulimits),
            env: self.env.merge_over(higher.env),
            volumes: self.volumes.merge_over(higher.volumes),
            post_start_commands: self
                .post_start_commands
                .merge_over(higher.post_start_commands),
            run_args: self.run_args.merge_over(higher.run_args),
            runtime: self.runtime.merge_over(higher.runtime),
            build: self.build.merge_over(higher.build),
            default: self.default.merge_over(higher.default),
            config_file_path: higher.config_file_path.or(self.config_file_path),
        }
    }

    /// The built-in defaults layer, lowest in precedence.
    pub fn builtin_defaults() -> Self {
        Self {
            image: Layered::Value("ubuntu:latest".to_string()),
            command: Layered::Value("bash".to_string()),
            auto_project_mount: Layered::Value(true),
            workdir: Layered::Value("auto".to_string()),
            gosu_path: Layered::Value("auto".to_string()),
            container_name: Layered::Value("ctenv-${project_dir|slug}-${pid}".to_string()),
            tty: Layered::Value(TtyMode::Auto),
            sudo: Layered::Value(false),
            env: Layered::Value(Vec::new()),
            volumes: Layered::Value(Vec::new()),
            subpaths: Layered::Value(Vec::new()),
            post_start_commands: Layered::Value(Vec::new()),
            run_args: Layered::Value(Vec::new()),
            runtime: Layered::Value(Runtime::Docker),
            ..Self::default()
        }
    }

    /// Per-layer invariant: `image` and `build` cannot both be set, and a
    /// set `build` needs exactly one dockerfile source.
    pub fn validate_layer(&self, scope: &str) -> ctenv_common::CtenvResult<()> {
        if let Layered::Value(build) = &self.build {
            if self.image.value().is_some() {
                return Err(ctenv_common::CtenvError::Config {
                    message: format!("{scope}: 'image' and 'build' are mutually exclusive"),
                });
            }
            let file_set = build.dockerfile.value().is_some();
            let content_set = build.dockerfile_content.value().is_some();
            if file_set && content_set {
                return Err(ctenv_common::CtenvError::Config {
                    message: format!(
                        "{scope}: build 'dockerfile' and 'dockerfile_content' are mutually exclusive"
                    ),
                });
            }
            if !file_set && !content_set {
                return Err(ctenv_common::CtenvError::Config {
                    message: format!(
                        "{scope}: build requires 'dockerfile' or 'dockerfile_content'"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Renderable `(field, value)` pairs for `config show`; unset fields
    /// are elided, cleared ones render as `null`.
    pub fn display_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        push_str(&mut out, "image", &self.image);
        push_str(&mut out, "command", &self.command);
        push_str(&mut out, "project_dir", &self.project_dir);
        push_str(&mut out, "project_target", &self.project_target);
        push_display(&mut out, "auto_project_mount", &self.auto_project_mount);
        push_list(&mut out, "subpaths", &self.subpaths);
        push_str(&mut out, "workdir", &self.workdir);
        push_str(&mut out, "gosu_path", &self.gosu_path);
        push_str(&mut out, "container_name", &self.container_name);
        push_display(&mut out, "tty", &self.tty);
        push_display(&mut out, "sudo", &self.sudo);
        push_str(&mut out, "network", &self.network);
        push_str(&mut out, "platform", &self.platform);
        if let Some(map) = render_layered(&self.ulimits, |m: &BTreeMap<String, UlimitValue>| {
            let entries: Vec<String> = m.iter().map(|(k, v)| format!("{k} = {v}")).collect();
            format!("{{ {} }}", entries.join(", "))
        }) {
            out.push(("ulimits", map));
        }
        push_list(&mut out, "env", &self.env);
        push_list(&mut out, "volumes", &self.volumes);
        push_list(&mut out, "post_start_commands", &self.post_start_commands);
        push_list(&mut out, "run_args", &self.run_args);
        push_display(&mut out, "runtime", &self.runtime);
        if let Some(build) = render_layered(&self.build, |b: &BuildConfig| {
            let mut parts = Vec::new();
            if let Some(v) = b.dockerfile.value() {
                parts.push(format!("dockerfile = \"{v}\""));
            }
            if let Some(v) = b.dockerfile_content.value() {
                parts.push(format!("dockerfile_content = ({} bytes)", v.len()));
            }
            if let Some(v) = b.context.value() {
                parts.push(format!("context = \"{v}\""));
            }
            if let Some(v) = b.tag.value() {
                parts.push(format!("tag = \"{v}\""));
            }
            if let Some(v) = b.args.value() {
                let args: Vec<String> =
                    v.iter().map(|(k, val)| format!("{k} = \"{val}\"")).collect();
                parts.push(format!("args = {{ {} }}", args.join(", ")));
            }
            format!("{{ {} }}", parts.join(", "))
        }) {
            out.push(("build", build));
        }
        push_display(&mut out, "default", &self.default);
        out
    }
}

fn render_layered<T>(field: &Layered<T>, f: impl FnOnce(&T) -> String) -> Option<String> {
    match field {
        Layered::Unset => None,
        Layered::Null => Some("null".to_string()),
        Layered::Value(v) => Some(f(v)),
    }
}

fn push_str(out: &mut Vec<(&'static str, String)>, name: &'static str, field: &Layered<String>) {
    if let Some(rendered) = render_layered(field, |v| format!("\"{v}\"")) {
        out.push((name, rendered));
    }
}

fn push_display<T: fmt::Display>(
    out: &mut Vec<(&'static str, String)>,
    name: &'static str,
    field: &Layered<T>,
) {
    if let Some(rendered) = render_layered(field, |v| v.to_string()) {
        out.push((name, rendered));
    }
}

fn push_list(out: &mut Vec<(&'static str, String)>, name: &'static str, field: &Layered<Vec<String>>) {
    if let Some(rendered) = render_layered(field, |v| {
        let items: Vec<String> = v.iter().map(|s| format!("\"{s}\"")).collect();
        format!("[{}]", items.join(", "))
    }) {
        out.push((name, rendered));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_layer_preserves_lower_value() {
        let lower = ContainerConfig {
            image: Layered::Value("alpine:3".to_string()),
            sudo: Layered::Value(true),
            ..Default::default()
        };
        let higher = ContainerConfig::default();
        let merged = lower.merge_over(higher);
        assert_eq!(merged.image.value().map(String::as_str), Some("alpine:3"));
        assert_eq!(merged.sudo.value(), Some(&true));
    }

    #[test]
    fn value_layer_overwrites_lower_value() {
        let lower = ContainerConfig {
            image: Layered::Value("alpine:3".to_string()),
            env: Layered::Value(vec!["A=1".to_string()]),
            ..Default::default()
        };
        let higher = ContainerConfig {
            image: Layered::Value("debian:12".to_string()),
            env: Layered::Value(Vec::new()),
            ..Default::default()
        };
        let merged = lower.merge_over(higher);
        assert_eq!(merged.image.value().map(String::as_str), Some("debian:12"));
        // Empty collections are values that do override; no concatenation.
        assert_eq!(merged.env.value(), Some(&Vec::new()));
    }

    #[test]
    fn explicit_null_overwrites_lower_value() {
        let lower = ContainerConfig {
            network: Layered::Value("bridge".to_string()),
            ..Default::default()
        };
        let higher = ContainerConfig {
            network: Layered::Null,
            ..Default::default()
        };
        let merged = lower.merge_over(higher);
        assert_eq!(merged.network, Layered::Null);
    }

    #[test]
    fn builtin_defaults_are_complete_enough_to_run() {
        let d = ContainerConfig::builtin_defaults();
        assert!(d.image.value().is_some());
        assert!(d.command.value().is_some());
        assert_eq!(d.auto_project_mount.value(), Some(&true));
        assert_eq!(d.workdir.value().map(String::as_str), Some("auto"));
        assert!(d.build.is_unset());
        assert!(d.network.is_unset());
    }

    #[test]
    fn layer_invariant_build_xor_image() {
        let layer = ContainerConfig {
            image: Layered::Value("alpine".to_string()),
            build: Layered::Value(BuildConfig {
                dockerfile: Layered::Value("Dockerfile".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(layer.validate_layer("container 'x'").is_err());

        let layer = ContainerConfig {
            build: Layered::Value(BuildConfig {
                dockerfile: Layered::Value("Dockerfile".to_string()),
                dockerfile_content: Layered::Value("FROM scratch".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(layer.validate_layer("container 'x'").is_err());

        let layer = ContainerConfig {
            build: Layered::Value(BuildConfig {
                dockerfile_content: Layered::Value("FROM scratch".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(layer.validate_layer("container 'x'").is_ok());
    }

    #[test]
    fn display_elides_unset_and_shows_null() {
        let cfg = ContainerConfig {
            image: Layered::Value("alpine".to_string()),
            network: Layered::Null,
            ..Default::default()
        };
        let fields = cfg.display_fields();
        assert!(fields.contains(&("image", "\"alpine\"".to_string())));
        assert!(fields.contains(&("network", "null".to_string())));
        assert!(!fields.iter().any(|(k, _)| *k == "platform"));
    }

    #[test]
    fn cli_notset_literal_parses_to_null() {
        assert_eq!(Layered::from_cli(Some(NOTSET.to_string())), Layered::Null);
        assert_eq!(
            Layered::from_cli(Some("x".to_string())),
            Layered::Value("x".to_string())
        );
        assert_eq!(Layered::from_cli(None), Layered::<String>::Unset);
    }
}
