//! Command-line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ctenv_common::shell;
use ctenv_common::{CtenvError, CtenvResult};

use crate::build::build_image;
use crate::config::file::{resolve_layer_paths, LayerOrigin};
use crate::config::{BuildConfig, ContainerConfig, CtenvConfig, Layered, Runtime, TtyMode, UlimitValue};
use crate::context::RuntimeContext;
use crate::runner::{run_container, RunOptions};
use crate::spec;
use crate::template::substitute_config;

/// ctenv runs a program in a container as the current user.
#[derive(Parser)]
#[command(name = "ctenv")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (repeat for trace logging)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Path to a configuration file (repeatable, order matters;
    /// suppresses discovery)
    #[arg(long, value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Project directory (default: nearest directory with a .ctenv.toml,
    /// falling back to the current directory)
    #[arg(short = 'p', long, value_name = "PATH")]
    pub project_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// ctenv commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in a container
    Run {
        /// Show the runtime command without running the container
        #[arg(long)]
        dry_run: bool,

        /// Container and build overrides.
        #[command(flatten)]
        overrides: ContainerArgs,

        /// Container to use (default: the one marked default = true)
        container: Option<String>,

        /// Command to run, after `--`
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Build a container's image without running it
    Build {
        /// Container and build overrides.
        #[command(flatten)]
        overrides: ContainerArgs,

        /// Container whose image to build
        container: String,
    },

    /// Configuration inspection
    Config {
        /// Config subcommands.
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Config inspection subcommands.
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Show the merged record for one container
        container: Option<String>,
    },
}

/// Container overrides shared by `run` and `build`.
#[derive(Args)]
pub struct ContainerArgs {
    /// Container runtime to invoke
    #[arg(long, value_enum)]
    pub runtime: Option<Runtime>,

    /// Container image to use
    #[arg(long)]
    pub image: Option<String>,

    /// In-container mount point for the project dir (PATH[:OPTS])
    #[arg(long, value_name = "SPEC")]
    pub project_target: Option<String>,

    /// Do not auto-mount the project directory
    #[arg(long)]
    pub no_auto_project_mount: bool,

    /// Project subpath to mount instead of the whole project (repeatable)
    #[arg(long = "subpath", value_name = "SPEC")]
    pub subpaths: Vec<String>,

    /// Working directory inside the container ("auto" preserves the
    /// host-relative cwd)
    #[arg(short = 'w', long, value_name = "PATH")]
    pub workdir: Option<String>,

    /// Path to the gosu binary (default: bundled, per target platform)
    #[arg(long, value_name = "PATH")]
    pub gosu_path: Option<String>,

    /// Container name (supports ${...} template variables)
    #[arg(long = "name", value_name = "NAME")]
    pub container_name: Option<String>,

    /// TTY allocation
    #[arg(long, value_enum)]
    pub tty: Option<TtyMode>,

    /// Add the user to sudoers with NOPASSWD inside the container
    #[arg(long)]
    pub sudo: bool,

    /// Container network (none, bridge, or a named network)
    #[arg(long, value_name = "NAME")]
    pub network: Option<String>,

    /// Container platform (e.g. linux/amd64, linux/arm64)
    #[arg(long, value_name = "STR")]
    pub platform: Option<String>,

    /// Resource limit (repeatable)
    #[arg(long = "ulimit", value_name = "NAME=VAL", value_parser = parse_key_val)]
    pub ulimits: Vec<(String, String)>,

    /// Set an environment variable (NAME=VALUE) or pass one through (NAME)
    #[arg(long = "env", value_name = "NAME[=VAL]")]
    pub env: Vec<String>,

    /// Mount an additional volume (HOST[:CONTAINER[:OPTS]], repeatable)
    #[arg(short = 'v', long = "volume", value_name = "SPEC")]
    pub volumes: Vec<String>,

    /// Command to run as root after setup, before the privilege drop
    /// (repeatable)
    #[arg(long = "post-start-command", value_name = "CMD")]
    pub post_start_commands: Vec<String>,

    /// Argument appended to the runtime invocation verbatim (repeatable)
    #[arg(long = "run-arg", value_name = "ARG")]
    pub run_args: Vec<String>,

    /// Build the image from this dockerfile
    #[arg(long, value_name = "PATH", conflicts_with = "build_dockerfile_content")]
    pub build_dockerfile: Option<String>,

    /// Build the image from inline dockerfile content
    #[arg(long, value_name = "STR")]
    pub build_dockerfile_content: Option<String>,

    /// Build context directory ("-" for an empty context)
    #[arg(long, value_name = "PATH")]
    pub build_context: Option<String>,

    /// Tag for the built image
    #[arg(long, value_name = "TAG")]
    pub build_tag: Option<String>,

    /// Build argument (repeatable)
    #[arg(long = "build-arg", value_name = "KEY=VAL", value_parser = parse_key_val)]
    pub build_args: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}

impl ContainerArgs {
    /// Convert the flags into a CLI configuration layer. Relative paths
    /// are resolved against the cwd afterwards by the caller.
    pub fn into_layer(self, command: Option<String>) -> ContainerConfig {
        let build_flag_present = self.build_dockerfile.is_some()
            || self.build_dockerfile_content.is_some()
            || self.build_context.is_some()
            || self.build_tag.is_some()
            || !self.build_args.is_empty();
        let build = if build_flag_present {
            Layered::Value(BuildConfig {
                dockerfile: Layered::from_cli(self.build_dockerfile),
                dockerfile_content: Layered::from_cli(self.build_dockerfile_content),
                context: Layered::from_cli(self.build_context),
                tag: Layered::from_cli(self.build_tag),
                args: if self.build_args.is_empty() {
                    Layered::Unset
                } else {
                    Layered::Value(self.build_args.into_iter().collect())
                },
            })
        } else {
            Layered::Unset
        };

        let ulimits = if self.ulimits.is_empty() {
            Layered::Unset
        } else {
            Layered::Value(
                self.ulimits
                    .into_iter()
                    .map(|(name, value)| {
                        let parsed = match value.parse::<i64>() {
                            Ok(n) => UlimitValue::Limit(n),
                            Err(_) => UlimitValue::SoftHard(value),
                        };
                        (name, parsed)
                    })
                    .collect::<BTreeMap<_, _>>(),
            )
        };

        ContainerConfig {
            image: Layered::from_cli(self.image),
            command: Layered::from_cli(command),
            project_target: Layered::from_cli(self.project_target),
            auto_project_mount: if self.no_auto_project_mount {
                Layered::Value(false)
            } else {
                Layered::Unset
            },
            subpaths: list_layer(self.subpaths),
            workdir: Layered::from_cli(self.workdir),
            gosu_path: Layered::from_cli(self.gosu_path),
            container_name: Layered::from_cli(self.container_name),
            tty: self.tty.into(),
            sudo: if self.sudo {
                Layered::Value(true)
            } else {
                Layered::Unset
            },
            network: Layered::from_cli(self.network),
            platform: Layered::from_cli(self.platform),
            ulimits,
            env: list_layer(self.env),
            volumes: list_layer(self.volumes),
            post_start_commands: list_layer(self.post_start_commands),
            run_args: list_layer(self.run_args),
            runtime: self.runtime.into(),
            build,
            ..ContainerConfig::default()
        }
    }
}

fn list_layer(items: Vec<String>) -> Layered<Vec<String>> {
    if items.is_empty() {
        Layered::Unset
    } else {
        Layered::Value(items)
    }
}

impl Cli {
    /// Execute the parsed command, returning the process exit code.
    pub fn execute(self) -> CtenvResult<i32> {
        let ctx = RuntimeContext::capture(self.project_dir.clone())?;
        let verbose = self.verbose > 0;
        let quiet = self.quiet;

        match self.command {
            Commands::Run {
                dry_run,
                overrides,
                container,
                command,
            } => {
                let command = if command.is_empty() {
                    None
                } else {
                    Some(shell::join(&command))
                };
                let spec = resolve_spec(
                    &ctx,
                    &self.config,
                    container.as_deref(),
                    overrides,
                    command,
                )?;

                if !quiet {
                    eprintln!("[ctenv] run");
                }
                if let Some(build) = &spec.build {
                    build_image(build, spec.runtime, dry_run)?;
                }
                run_container(
                    &spec,
                    &RunOptions {
                        dry_run,
                        verbose,
                        quiet,
                    },
                )
            }

            Commands::Build {
                overrides,
                container,
            } => {
                let spec = resolve_spec(&ctx, &self.config, Some(container.as_str()), overrides, None)?;
                let build = spec.build.as_ref().ok_or_else(|| CtenvError::Config {
                    message: format!("container '{container}' has no build section"),
                })?;
                let tag = build_image(build, spec.runtime, false)?;
                if !quiet {
                    eprintln!("[ctenv] built {tag}");
                }
                Ok(0)
            }

            Commands::Config { command } => {
                let config = CtenvConfig::load(&ctx, &self.config)?;
                match command {
                    None | Some(ConfigCommands::Show { container: None }) => {
                        show_all(&config);
                    }
                    Some(ConfigCommands::Show {
                        container: Some(name),
                    }) => {
                        let merged = config.resolve(Some(name.as_str()), ContainerConfig::default())?;
                        println!("{name}:");
                        for (field, value) in merged.display_fields() {
                            println!("  {field} = {value}");
                        }
                    }
                }
                Ok(0)
            }
        }
    }
}

/// The shared run/build front half: load, layer, substitute, resolve.
fn resolve_spec(
    ctx: &RuntimeContext,
    explicit_configs: &[PathBuf],
    container: Option<&str>,
    overrides: ContainerArgs,
    command: Option<String>,
) -> CtenvResult<spec::ContainerSpec> {
    let config = CtenvConfig::load(ctx, explicit_configs)?;

    let mut cli_layer = overrides.into_layer(command);
    resolve_layer_paths(&mut cli_layer, LayerOrigin::Cli(&ctx.cwd), &ctx.user_home)?;
    cli_layer.validate_layer("command line")?;

    let mut merged = config.resolve(container, cli_layer)?;
    substitute_config(&mut merged, ctx)?;
    spec::resolve(&merged, ctx)
}

fn show_all(config: &CtenvConfig) {
    println!("defaults:");
    for (field, value) in config.defaults.display_fields() {
        println!("  {field} = {value}");
    }
    println!();
    println!("containers:");
    if config.containers.is_empty() {
        println!("# No containers defined");
    }
    for (name, container) in &config.containers {
        println!("  {name}:");
        for (field, value) in container.display_fields() {
            println!("    {field} = {value}");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn run_command_after_separator() {
        let cli = parse(&["ctenv", "run", "dev", "--", "npm", "test"]);
        match cli.command {
            Commands::Run {
                container, command, ..
            } => {
                assert_eq!(container.as_deref(), Some("dev"));
                assert_eq!(command, vec!["npm", "test"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_without_container_name() {
        let cli = parse(&["ctenv", "run", "--", "ls", "-la"]);
        match cli.command {
            Commands::Run {
                container, command, ..
            } => {
                assert_eq!(container, None);
                assert_eq!(command, vec!["ls", "-la"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn volume_short_flag_is_local_to_run() {
        let cli = parse(&["ctenv", "-v", "run", "-v", "/a:/b", "--", "true"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run { overrides, .. } => {
                assert_eq!(overrides.volumes, vec!["/a:/b"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn dockerfile_flags_conflict() {
        let result = Cli::try_parse_from([
            "ctenv",
            "run",
            "--build-dockerfile",
            "Dockerfile",
            "--build-dockerfile-content",
            "FROM alpine",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn bad_ulimit_is_a_usage_error() {
        let result = Cli::try_parse_from(["ctenv", "run", "--ulimit", "nofile"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_layer_conversion() {
        let cli = parse(&[
            "ctenv",
            "run",
            "--image",
            "alpine",
            "--network",
            "NOTSET",
            "--sudo",
            "--no-auto-project-mount",
            "--ulimit",
            "nofile=1024",
            "--tty",
            "no",
        ]);
        let Commands::Run { overrides, .. } = cli.command else {
            panic!("expected run");
        };
        let layer = overrides.into_layer(None);
        assert_eq!(layer.image.value().map(String::as_str), Some("alpine"));
        assert_eq!(layer.network, Layered::Null);
        assert_eq!(layer.sudo.value(), Some(&true));
        assert_eq!(layer.auto_project_mount.value(), Some(&false));
        assert_eq!(layer.tty.value(), Some(&TtyMode::No));
        assert_eq!(
            layer.ulimits.value().unwrap()["nofile"],
            UlimitValue::Limit(1024)
        );
        assert!(layer.command.is_unset());
        assert!(layer.build.is_unset());
    }

    #[test]
    fn build_flags_form_a_build_section() {
        let cli = parse(&[
            "ctenv",
            "build",
            "dev",
            "--build-dockerfile-content",
            "FROM alpine",
            "--build-context",
            "-",
            "--build-arg",
            "A=1",
        ]);
        let Commands::Build { overrides, .. } = cli.command else {
            panic!("expected build");
        };
        let layer = overrides.into_layer(None);
        let build = layer.build.value().unwrap();
        assert_eq!(
            build.dockerfile_content.value().map(String::as_str),
            Some("FROM alpine")
        );
        assert_eq!(build.context.value().map(String::as_str), Some("-"));
        assert_eq!(build.args.value().unwrap()["A"], "1");
    }
}
