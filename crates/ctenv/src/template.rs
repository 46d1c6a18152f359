//! Template variable substitution.
//!
//! Expands `${name}` and `${name|filter}` in every string and string-list
//! field of the merged record, after merging and before spec resolution.
//! The only filter is `slug`, which makes image references and paths safe
//! for container names and tags. Unknown variables and filters are hard
//! errors; there is no empty-string fallback.

use std::collections::BTreeMap;

use ctenv_common::{CtenvError, CtenvResult};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ContainerConfig, Layered};
use crate::context::RuntimeContext;

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}|]+)(?:\|([^}]+))?\}").expect("static pattern"));

/// The variable namespace for one substitution pass.
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    /// Build the namespace from the merged record and the runtime context.
    pub fn new(config: &ContainerConfig, ctx: &RuntimeContext) -> Self {
        let mut values = BTreeMap::new();
        if let Some(image) = config.image.value() {
            values.insert("image".to_string(), image.clone());
        }
        if let Some(command) = config.command.value() {
            values.insert("command".to_string(), command.clone());
        }
        values.insert("user_name".to_string(), ctx.user_name.clone());
        values.insert("user_id".to_string(), ctx.user_id.to_string());
        values.insert(
            "user_home".to_string(),
            ctx.user_home.to_string_lossy().into_owned(),
        );
        values.insert("group_name".to_string(), ctx.group_name.clone());
        values.insert("group_id".to_string(), ctx.group_id.to_string());
        values.insert(
            "project_dir".to_string(),
            ctx.project_dir.to_string_lossy().into_owned(),
        );
        values.insert("pid".to_string(), ctx.pid.to_string());
        Self { values }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(env_name) = name.strip_prefix("env.") {
            // Unset environment variables substitute as empty.
            return Some(std::env::var(env_name).unwrap_or_default());
        }
        self.values.get(name).cloned()
    }
}

/// Replace `/` and `:` with `-`, producing filesystem- and tag-safe names.
pub fn slug(value: &str) -> String {
    value.replace(['/', ':'], "-")
}

/// Expand all template expressions in `text`. `field` names the
/// originating config field for error reporting.
pub fn substitute(text: &str, vars: &Variables, field: &str) -> CtenvResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in VAR_PATTERN.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&text[last..whole.start()]);
        last = whole.end();

        let name = caps.get(1).expect("variable name").as_str().trim();
        let value = vars.lookup(name).ok_or_else(|| CtenvError::Template {
            expression: whole.as_str().to_string(),
            field: field.to_string(),
            reason: format!("unknown variable '{name}'"),
        })?;

        let value = match caps.get(2).map(|m| m.as_str().trim()) {
            None => value,
            Some("slug") => slug(&value),
            Some(other) => {
                return Err(CtenvError::Template {
                    expression: whole.as_str().to_string(),
                    field: field.to_string(),
                    reason: format!("unknown filter '{other}'"),
                })
            }
        };
        out.push_str(&value);
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn substitute_field(
    field: &mut Layered<String>,
    vars: &Variables,
    name: &str,
) -> CtenvResult<()> {
    if let Layered::Value(v) = field {
        *v = substitute(v, vars, name)?;
    }
    Ok(())
}

fn substitute_list(
    field: &mut Layered<Vec<String>>,
    vars: &Variables,
    name: &str,
) -> CtenvResult<()> {
    if let Layered::Value(items) = field {
        for item in items.iter_mut() {
            *item = substitute(item, vars, name)?;
        }
    }
    Ok(())
}

/// Apply substitution to every string and string-list field of the merged
/// record, including the build section.
pub fn substitute_config(config: &mut ContainerConfig, ctx: &RuntimeContext) -> CtenvResult<()> {
    let vars = Variables::new(config, ctx);

    substitute_field(&mut config.image, &vars, "image")?;
    substitute_field(&mut config.command, &vars, "command")?;
    substitute_field(&mut config.project_dir, &vars, "project_dir")?;
    substitute_field(&mut config.project_target, &vars, "project_target")?;
    substitute_field(&mut config.workdir, &vars, "workdir")?;
    substitute_field(&mut config.gosu_path, &vars, "gosu_path")?;
    substitute_field(&mut config.container_name, &vars, "container_name")?;
    substitute_field(&mut config.network, &vars, "network")?;
    substitute_field(&mut config.platform, &vars, "platform")?;
    substitute_list(&mut config.subpaths, &vars, "subpaths")?;
    substitute_list(&mut config.env, &vars, "env")?;
    substitute_list(&mut config.volumes, &vars, "volumes")?;
    substitute_list(&mut config.post_start_commands, &vars, "post_start_commands")?;
    substitute_list(&mut config.run_args, &vars, "run_args")?;

    if let Layered::Value(build) = &mut config.build {
        substitute_field(&mut build.dockerfile, &vars, "build.dockerfile")?;
        substitute_field(&mut build.dockerfile_content, &vars, "build.dockerfile_content")?;
        substitute_field(&mut build.context, &vars, "build.context")?;
        substitute_field(&mut build.tag, &vars, "build.tag")?;
        if let Layered::Value(args) = &mut build.args {
            for (key, value) in args.iter_mut() {
                *value = substitute(value, &vars, &format!("build.args.{key}"))?;
            }
        }
    }

    Ok(())
}
