//! Entrypoint script generation.
//!
//! The generated script runs as root inside the container under `/bin/sh`,
//! creates a user and group matching the host identity, fixes ownership,
//! runs post-start commands, and finally drops privileges through the gosu
//! helper into the user command. It must work under both GNU coreutils and
//! BusyBox, so user/group creation dispatches on `command -v` probes
//! instead of distribution sniffing.
//!
//! Every value that originates in configuration is rendered through
//! [`ctenv_common::shell::quote`]; nothing is interpolated unquoted.

use ctenv_common::shell::quote;
use ctenv_common::{CtenvError, CtenvResult};

use crate::spec::ContainerSpec;
use crate::GOSU_MOUNT;

/// Render the entrypoint script for a resolved spec.
///
/// `verbose` and `quiet` mirror the tool's own verbosity into the script's
/// `log_debug`/`log_info` helpers.
pub fn render(spec: &ContainerSpec, verbose: bool, quiet: bool) -> CtenvResult<String> {
    for path in &spec.chown_paths {
        if !path.starts_with('/') {
            return Err(CtenvError::Path {
                path: path.into(),
                message: "chown requires an absolute container path".to_string(),
            });
        }
    }

    let mut s = Script::new();
    let user = quote(&spec.user_name);
    let group = quote(&spec.group_name);
    let home = quote(&spec.user_home.to_string_lossy());
    let uid = spec.user_id;
    let gid = spec.group_id;

    s.line("#!/bin/sh");
    s.line("# Runs as root; sets up the target identity, then drops privileges.");
    s.line("set -eu");
    s.line("unset IFS");
    s.blank();
    s.line(format!("VERBOSE={}", if verbose { 1 } else { 0 }));
    s.line(format!("QUIET={}", if quiet { 1 } else { 0 }));
    s.blank();
    s.line(format!("USER_NAME={user}"));
    s.line(format!("USER_ID={uid}"));
    s.line(format!("GROUP_NAME={group}"));
    s.line(format!("GROUP_ID={gid}"));
    s.line(format!("USER_HOME={home}"));
    s.blank();
    s.block(
        r#"log_debug() {
    if [ "$VERBOSE" = "1" ]; then
        echo "[ctenv] $*" >&2
    fi
}

log_info() {
    if [ "$QUIET" != "1" ]; then
        echo "[ctenv] $*" >&2
    fi
}

log_debug "Starting container setup for $USER_NAME ($USER_ID:$GROUP_ID)"

# Reuse a group with the target gid when one exists.
if getent group "$GROUP_ID" >/dev/null 2>&1; then
    GROUP_NAME=$(getent group "$GROUP_ID" | cut -d: -f1)
    log_debug "Using existing group: $GROUP_NAME"
else
    log_debug "Creating group $GROUP_NAME ($GROUP_ID)"
    if command -v groupadd >/dev/null 2>&1; then
        groupadd -g "$GROUP_ID" "$GROUP_NAME"
    else
        addgroup -g "$GROUP_ID" "$GROUP_NAME"
    fi
fi

# Reuse a user with the target uid when one exists.
if getent passwd "$USER_ID" >/dev/null 2>&1; then
    USER_NAME=$(getent passwd "$USER_ID" | cut -d: -f1)
    log_debug "Using existing user: $USER_NAME"
else
    log_debug "Creating user $USER_NAME ($USER_ID)"
    if command -v useradd >/dev/null 2>&1; then
        useradd -u "$USER_ID" -g "$GROUP_ID" -d "$USER_HOME" -M -s /bin/sh "$USER_NAME"
    else
        adduser -D -H -u "$USER_ID" -G "$GROUP_NAME" -h "$USER_HOME" -s /bin/sh "$USER_NAME"
    fi
fi

if [ ! -d "$USER_HOME" ]; then
    log_debug "Creating home directory $USER_HOME"
    mkdir -p "$USER_HOME"
fi
chown "$USER_ID:$GROUP_ID" "$USER_HOME"
"#,
    );
    s.blank();

    if spec.sudo {
        s.block(
            r#"if ! command -v sudo >/dev/null 2>&1; then
    if command -v apt-get >/dev/null 2>&1; then
        log_info "Installing sudo..."
        apt-get update -qq && apt-get install -y -qq sudo
    elif command -v yum >/dev/null 2>&1; then
        log_info "Installing sudo..."
        yum install -y -q sudo
    elif command -v dnf >/dev/null 2>&1; then
        log_info "Installing sudo..."
        dnf install -y -q sudo
    elif command -v apk >/dev/null 2>&1; then
        log_info "Installing sudo..."
        apk add --no-cache sudo
    else
        echo "ERROR: sudo not installed and no supported package manager found" >&2
        exit 1
    fi
fi
"#,
        );
        s.line(format!(
            "echo {} >> /etc/sudoers",
            quote(&format!("{} ALL=(ALL) NOPASSWD:ALL", spec.user_name))
        ));
        s.blank();
    }

    for path in &spec.chown_paths {
        s.line(format!("log_debug {}", quote(&format!("Fixing ownership of {path}"))));
        s.line(format!("chown -R {uid}:{gid} {}", quote(path)));
    }
    if !spec.chown_paths.is_empty() {
        s.blank();
    }

    for cmd in &spec.post_start_commands {
        s.line(format!(
            "log_debug {}",
            quote(&format!("Running post-start command: {cmd}"))
        ));
        s.line(format!("/bin/sh -c {}", quote(cmd)));
    }
    if !spec.post_start_commands.is_empty() {
        s.blank();
    }

    let (command, ps1) = final_command(spec);

    s.line(format!("export HOME={home}"));
    s.line(format!("export USER={user}"));
    s.line(format!("export LOGNAME={user}"));
    s.line("export SHELL='/bin/sh'");
    if let Some(ps1) = &ps1 {
        s.line(format!("export PS1={}", quote(ps1)));
    }
    s.blank();
    s.line(format!(
        "log_info {}",
        quote(&format!("Starting command as {}: {}", spec.user_name, command))
    ));

    let interactive = if spec.tty { "-i " } else { "" };
    s.line(format!(
        "exec {} \"$USER_NAME\" /bin/sh {}-c {}",
        quote(GOSU_MOUNT),
        interactive,
        quote(&command)
    ));

    Ok(s.into_string())
}

/// Line-oriented script accumulator; keeps the rendering in one place so
/// nothing is appended without going through it.
struct Script(String);

impl Script {
    fn new() -> Self {
        Self(String::new())
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.0.push_str(text.as_ref());
        self.0.push('\n');
    }

    fn blank(&mut self) {
        self.0.push('\n');
    }

    fn block(&mut self, text: &str) {
        self.0.push_str(text);
    }

    fn into_string(self) -> String {
        self.0
    }
}

/// The command the dropped-privilege shell executes, plus the PS1 value to
/// thread through when the env list mentions it.
///
/// Because the entrypoint is not sourced as an interactive shell, a PS1
/// passed only via `--env` does not survive into the final shell, so it is
/// exported explicitly; and when the command launches bash, `--norc` keeps
/// rc files from overwriting it.
fn final_command(spec: &ContainerSpec) -> (String, Option<String>) {
    let ps1 = spec.env.iter().find_map(|entry| {
        if let Some(value) = entry.strip_prefix("PS1=") {
            Some(value.to_string())
        } else if entry == "PS1" {
            std::env::var("PS1").ok()
        } else {
            None
        }
    });

    let mut command = spec.command.clone();
    if ps1.is_some() {
        if let Some(rest) = command.strip_prefix("bash") {
            if rest.is_empty() || rest.starts_with(' ') {
                command = format!("bash --norc{rest}");
            }
        }
    }
    (command, ps1)
}
