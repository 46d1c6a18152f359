//! Config file loading, schema validation, discovery, and layering.
//!
//! Files are parsed into [`toml::Table`] and converted field by field so
//! that the four load-time failure kinds stay distinguishable: unreadable
//! file, invalid TOML, unknown key, wrong value shape. Relative paths are
//! resolved against the file's own directory at load time; CLI layers are
//! resolved against the cwd by the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ctenv_common::paths::{expand_tilde, resolve_relative};
use ctenv_common::{CtenvError, CtenvResult};
use toml::Value;

use crate::config::{
    BuildConfig, ContainerConfig, Layered, Runtime, TtyMode, UlimitValue, NOTSET,
};
use crate::context::{find_project_config, RuntimeContext};
use crate::volume::VolumeSpec;
use crate::CONFIG_FILE_NAME;

/// Where a layer's path-valued fields resolve their relative forms.
#[derive(Debug, Clone, Copy)]
pub enum LayerOrigin<'a> {
    /// A config file; relative paths resolve against its directory.
    File(&'a Path),
    /// The command line; relative paths resolve against the cwd, and a
    /// relative `--workdir` is rejected outright.
    Cli(&'a Path),
}

/// A single parsed configuration file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// The `[defaults]` section, when present.
    pub defaults: Option<ContainerConfig>,
    /// The `[containers.*]` sections by name.
    pub containers: BTreeMap<String, ContainerConfig>,
    /// The file this came from.
    pub path: PathBuf,
}

impl ConfigFile {
    /// Load and validate one configuration file.
    pub fn load(path: &Path, home: &Path) -> CtenvResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CtenvError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let table: toml::Table = text.parse().map_err(|e: toml::de::Error| {
            CtenvError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        for key in table.keys() {
            if key != "defaults" && key != "containers" {
                return Err(CtenvError::ConfigSchema {
                    path: path.to_path_buf(),
                    scope: "top level".to_string(),
                    key: key.clone(),
                });
            }
        }

        let file_dir = path.parent().unwrap_or(Path::new("/"));
        let origin = LayerOrigin::File(file_dir);

        let defaults = match table.get("defaults") {
            None => None,
            Some(Value::Table(t)) => {
                let mut cfg = container_config_from_table(t, path, "defaults")?;
                cfg.config_file_path = Some(path.to_path_buf());
                resolve_layer_paths(&mut cfg, origin, home)?;
                cfg.validate_layer("defaults")?;
                Some(cfg)
            }
            Some(other) => {
                return Err(wrong_type(path_scope(path), "defaults", "table", other));
            }
        };

        let mut containers = BTreeMap::new();
        match table.get("containers") {
            None => {}
            Some(Value::Table(t)) => {
                for (name, section) in t {
                    let Value::Table(section) = section else {
                        return Err(wrong_type(
                            path_scope(path),
                            &format!("containers.{name}"),
                            "table",
                            section,
                        ));
                    };
                    let scope = format!("container '{name}'");
                    let mut cfg = container_config_from_table(section, path, &scope)?;
                    cfg.config_file_path = Some(path.to_path_buf());
                    resolve_layer_paths(&mut cfg, origin, home)?;
                    cfg.validate_layer(&scope)?;
                    containers.insert(name.clone(), cfg);
                }
            }
            Some(other) => {
                return Err(wrong_type(path_scope(path), "containers", "table", other));
            }
        }

        tracing::debug!(path = %path.display(), containers = containers.len(), "loaded config file");
        Ok(Self {
            defaults,
            containers,
            path: path.to_path_buf(),
        })
    }
}

/// The computed configuration: layered defaults plus the container index,
/// ready for per-invocation resolution.
#[derive(Debug, Clone)]
pub struct CtenvConfig {
    /// Built-in defaults with every file's `[defaults]` layered on top.
    pub defaults: ContainerConfig,
    /// Containers by name; a name defined in a higher-precedence file
    /// fully shadows the same name from a lower one.
    pub containers: BTreeMap<String, ContainerConfig>,
    /// Files consulted, lowest precedence first.
    pub files: Vec<PathBuf>,
}

impl CtenvConfig {
    /// Load configuration for this invocation.
    ///
    /// With no explicit files, discovery applies: `~/.ctenv.toml` then the
    /// nearest project `.ctenv.toml` walking up from the cwd (stopping at
    /// the home directory and at mount boundaries). Explicit files
    /// suppress discovery of the project file set entirely and layer in
    /// the given order, later files higher.
    pub fn load(ctx: &RuntimeContext, explicit: &[PathBuf]) -> CtenvResult<Self> {
        let mut files: Vec<ConfigFile> = Vec::new();

        if explicit.is_empty() {
            let user_path = ctx.user_home.join(CONFIG_FILE_NAME);
            if user_path.is_file() {
                files.push(ConfigFile::load(&user_path, &ctx.user_home)?);
            }
            if let Some(project_path) = find_project_config(&ctx.cwd, &ctx.user_home) {
                files.push(ConfigFile::load(&project_path, &ctx.user_home)?);
            }
        } else {
            for path in explicit {
                if !path.is_file() {
                    return Err(CtenvError::ConfigLoad {
                        path: path.clone(),
                        reason: "no such file".to_string(),
                    });
                }
                files.push(ConfigFile::load(path, &ctx.user_home)?);
            }
        }

        let mut defaults = ContainerConfig::builtin_defaults();
        for file in &files {
            if let Some(file_defaults) = &file.defaults {
                defaults = defaults.merge_over(file_defaults.clone());
            }
        }

        let mut containers: BTreeMap<String, ContainerConfig> = BTreeMap::new();
        for file in &files {
            // Atomic replacement: no merge between same-named containers
            // from different files.
            for (name, cfg) in &file.containers {
                containers.insert(name.clone(), cfg.clone());
            }
        }

        Ok(Self {
            defaults,
            containers,
            files: files.into_iter().map(|f| f.path).collect(),
        })
    }

    /// The container to use when the CLI names none: the single container
    /// marked `default = true`, if any.
    pub fn default_container(&self) -> CtenvResult<Option<&str>> {
        let marked: Vec<&str> = self
            .containers
            .iter()
            .filter(|(_, cfg)| cfg.default.value() == Some(&true))
            .map(|(name, _)| name.as_str())
            .collect();
        match marked.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(one)),
            many => Err(CtenvError::AmbiguousDefault {
                names: many.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    /// Merge the effective record for `name` (or the default container)
    /// with `cli` layered on top.
    pub fn resolve(
        &self,
        name: Option<&str>,
        cli: ContainerConfig,
    ) -> CtenvResult<ContainerConfig> {
        let selected = match name {
            Some(name) => Some(self.containers.get(name).ok_or_else(|| {
                CtenvError::UnknownContainer {
                    name: name.to_string(),
                    available: self.containers.keys().cloned().collect(),
                }
            })?),
            None => match self.default_container()? {
                Some(default_name) => self.containers.get(default_name),
                None => None,
            },
        };

        let mut merged = self.defaults.clone();
        if let Some(container) = selected {
            merged = merged.merge_over(container.clone());
        }
        Ok(merged.merge_over(cli))
    }
}

fn path_scope(path: &Path) -> String {
    path.display().to_string()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Integer(_) => "integer",
        Value::Float(_) => "float",
        Value::Boolean(_) => "boolean",
        Value::Datetime(_) => "datetime",
        Value::Array(_) => "array",
        Value::Table(_) => "table",
    }
}

fn wrong_type(scope: String, field: &str, expected: &str, found: &Value) -> CtenvError {
    CtenvError::ConfigType {
        scope,
        field: field.to_string(),
        expected: expected.to_string(),
        found: type_name(found).to_string(),
    }
}

fn is_notset(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == NOTSET)
}

fn layered_string(value: &Value, scope: &str, field: &str) -> CtenvResult<Layered<String>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::String(s) => Ok(Layered::Value(s.clone())),
        other => Err(wrong_type(scope.to_string(), field, "string", other)),
    }
}

fn layered_bool(value: &Value, scope: &str, field: &str) -> CtenvResult<Layered<bool>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::Boolean(b) => Ok(Layered::Value(*b)),
        other => Err(wrong_type(scope.to_string(), field, "boolean", other)),
    }
}

fn layered_string_list(
    value: &Value,
    scope: &str,
    field: &str,
) -> CtenvResult<Layered<Vec<String>>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => {
                        return Err(wrong_type(
                            scope.to_string(),
                            field,
                            "array of strings",
                            other,
                        ))
                    }
                }
            }
            Ok(Layered::Value(out))
        }
        other => Err(wrong_type(
            scope.to_string(),
            field,
            "array of strings",
            other,
        )),
    }
}

fn layered_tty(value: &Value, scope: &str, field: &str) -> CtenvResult<Layered<TtyMode>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::Boolean(true) => Ok(Layered::Value(TtyMode::Yes)),
        Value::Boolean(false) => Ok(Layered::Value(TtyMode::No)),
        Value::String(s) => match s.as_str() {
            "auto" => Ok(Layered::Value(TtyMode::Auto)),
            "yes" => Ok(Layered::Value(TtyMode::Yes)),
            "no" => Ok(Layered::Value(TtyMode::No)),
            _ => Err(wrong_type(
                scope.to_string(),
                field,
                "\"auto\", \"yes\", \"no\", or boolean",
                value,
            )),
        },
        other => Err(wrong_type(
            scope.to_string(),
            field,
            "\"auto\", \"yes\", \"no\", or boolean",
            other,
        )),
    }
}

fn layered_runtime(value: &Value, scope: &str, field: &str) -> CtenvResult<Layered<Runtime>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::String(s) => match s.as_str() {
            "docker" => Ok(Layered::Value(Runtime::Docker)),
            "podman" => Ok(Layered::Value(Runtime::Podman)),
            _ => Err(wrong_type(
                scope.to_string(),
                field,
                "\"docker\" or \"podman\"",
                value,
            )),
        },
        other => Err(wrong_type(
            scope.to_string(),
            field,
            "\"docker\" or \"podman\"",
            other,
        )),
    }
}

fn layered_ulimits(
    value: &Value,
    scope: &str,
    field: &str,
) -> CtenvResult<Layered<BTreeMap<String, UlimitValue>>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::Table(t) => {
            let mut out = BTreeMap::new();
            for (name, v) in t {
                let parsed = match v {
                    Value::Integer(n) => UlimitValue::Limit(*n),
                    Value::String(s) => UlimitValue::SoftHard(s.clone()),
                    other => {
                        return Err(wrong_type(
                            scope.to_string(),
                            &format!("{field}.{name}"),
                            "integer or \"soft:hard\" string",
                            other,
                        ))
                    }
                };
                out.insert(name.clone(), parsed);
            }
            Ok(Layered::Value(out))
        }
        other => Err(wrong_type(
            scope.to_string(),
            field,
            "table of limits",
            other,
        )),
    }
}

fn layered_string_map(
    value: &Value,
    scope: &str,
    field: &str,
) -> CtenvResult<Layered<BTreeMap<String, String>>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    match value {
        Value::Table(t) => {
            let mut out = BTreeMap::new();
            for (name, v) in t {
                match v {
                    Value::String(s) => {
                        out.insert(name.clone(), s.clone());
                    }
                    other => {
                        return Err(wrong_type(
                            scope.to_string(),
                            &format!("{field}.{name}"),
                            "string",
                            other,
                        ))
                    }
                }
            }
            Ok(Layered::Value(out))
        }
        other => Err(wrong_type(
            scope.to_string(),
            field,
            "table of strings",
            other,
        )),
    }
}

fn build_config_from_value(value: &Value, path: &Path, scope: &str) -> CtenvResult<Layered<BuildConfig>> {
    if is_notset(value) {
        return Ok(Layered::Null);
    }
    let Value::Table(table) = value else {
        return Err(wrong_type(scope.to_string(), "build", "table", value));
    };
    let mut build = BuildConfig::default();
    for (key, v) in table {
        match key.as_str() {
            "dockerfile" => build.dockerfile = layered_string(v, scope, "build.dockerfile")?,
            "dockerfile_content" => {
                build.dockerfile_content = layered_string(v, scope, "build.dockerfile_content")?
            }
            "context" => build.context = layered_string(v, scope, "build.context")?,
            "tag" => build.tag = layered_string(v, scope, "build.tag")?,
            "args" => build.args = layered_string_map(v, scope, "build.args")?,
            other => {
                return Err(CtenvError::ConfigSchema {
                    path: path.to_path_buf(),
                    scope: format!("{scope}.build"),
                    key: other.to_string(),
                })
            }
        }
    }
    Ok(Layered::Value(build))
}

/// Convert one TOML section into a layer record, rejecting unknown keys.
fn container_config_from_table(
    table: &toml::Table,
    path: &Path,
    scope: &str,
) -> CtenvResult<ContainerConfig> {
    let full_scope = format!("{scope} ({})", path.display());
    let s = full_scope.as_str();
    let mut cfg = ContainerConfig::default();
    for (key, value) in table {
        match key.as_str() {
            "image" => cfg.image = layered_string(value, s, "image")?,
            "command" => cfg.command = layered_string(value, s, "command")?,
            "project_dir" => cfg.project_dir = layered_string(value, s, "project_dir")?,
            "project_target" => cfg.project_target = layered_string(value, s, "project_target")?,
            "auto_project_mount" => {
                cfg.auto_project_mount = layered_bool(value, s, "auto_project_mount")?
            }
            "subpaths" => cfg.subpaths = layered_string_list(value, s, "subpaths")?,
            "workdir" => cfg.workdir = layered_string(value, s, "workdir")?,
            "gosu_path" => cfg.gosu_path = layered_string(value, s, "gosu_path")?,
            "container_name" => cfg.container_name = layered_string(value, s, "container_name")?,
            "tty" => cfg.tty = layered_tty(value, s, "tty")?,
            "sudo" => cfg.sudo = layered_bool(value, s, "sudo")?,
            "network" => cfg.network = layered_string(value, s, "network")?,
            "platform" => cfg.platform = layered_string(value, s, "platform")?,
            "ulimits" => cfg.ulimits = layered_ulimits(value, s, "ulimits")?,
            "env" => cfg.env = layered_string_list(value, s, "env")?,
            "volumes" => cfg.volumes = layered_string_list(value, s, "volumes")?,
            "post_start_commands" => {
                cfg.post_start_commands = layered_string_list(value, s, "post_start_commands")?
            }
            "run_args" => cfg.run_args = layered_string_list(value, s, "run_args")?,
            "runtime" => cfg.runtime = layered_runtime(value, s, "runtime")?,
            "build" => cfg.build = build_config_from_value(value, path, scope)?,
            "default" => cfg.default = layered_bool(value, s, "default")?,
            other => {
                return Err(CtenvError::ConfigSchema {
                    path: path.to_path_buf(),
                    scope: scope.to_string(),
                    key: other.to_string(),
                })
            }
        }
    }
    Ok(cfg)
}

/// Resolve relative and tilde forms in a layer's path-valued fields.
///
/// File layers resolve against the file's directory, CLI layers against
/// the cwd. Container-side paths (`project_target`'s path component,
/// `workdir`) only get relative resolution for file layers; a relative
/// CLI `--workdir` is rejected since it names a location inside the
/// container.
pub fn resolve_layer_paths(
    cfg: &mut ContainerConfig,
    origin: LayerOrigin<'_>,
    home: &Path,
) -> CtenvResult<()> {
    let base = match origin {
        LayerOrigin::File(dir) => dir,
        LayerOrigin::Cli(cwd) => cwd,
    };

    let resolve_host = |s: &str| -> String { resolve_relative(&expand_tilde(s, home), base) };

    if let Layered::Value(v) = &mut cfg.project_dir {
        *v = resolve_host(v);
    }
    if let Layered::Value(v) = &mut cfg.gosu_path {
        if v != "auto" {
            *v = resolve_host(v);
        }
    }
    if let Layered::Value(v) = &mut cfg.project_target {
        let (path, opts) = match v.split_once(':') {
            Some((p, o)) => (p.to_string(), Some(o.to_string())),
            None => (v.clone(), None),
        };
        let resolved = resolve_relative(&path, base);
        *v = match opts {
            Some(o) => format!("{resolved}:{o}"),
            None => resolved,
        };
    }
    if let Layered::Value(v) = &mut cfg.workdir {
        if v != "auto" {
            match origin {
                LayerOrigin::File(_) => *v = resolve_relative(v, base),
                LayerOrigin::Cli(_) => {
                    if !v.starts_with('/') {
                        return Err(CtenvError::Path {
                            path: PathBuf::from(v.clone()),
                            message: "--workdir must be an absolute in-container path".to_string(),
                        });
                    }
                }
            }
        }
    }

    for field in [&mut cfg.volumes, &mut cfg.subpaths] {
        if let Layered::Value(specs) = field {
            for spec_str in specs.iter_mut() {
                let mut spec = VolumeSpec::parse(spec_str)?;
                spec.host = resolve_host(&spec.host);
                *spec_str = spec.to_spec_string();
            }
        }
    }

    if let Layered::Value(build) = &mut cfg.build {
        if let Layered::Value(v) = &mut build.dockerfile {
            *v = resolve_host(v);
        }
        if let Layered::Value(v) = &mut build.context {
            if v != "-" {
                *v = resolve_host(v);
            }
        }
    }

    Ok(())
}
