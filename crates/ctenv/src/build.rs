//! Image building.
//!
//! Invokes the selected runtime's `build` subcommand. A build always runs
//! before the container run; the resulting tag is what the run uses as its
//! image. The runtime's output stays on the terminal so build failures are
//! visible verbatim.

use std::io::Write as _;
use std::process::{Command, Stdio};

use ctenv_common::paths::find_in_path;
use ctenv_common::shell;
use ctenv_common::{CtenvError, CtenvResult};

use crate::config::Runtime;
use crate::spec::{BuildContext, BuildSpec};

/// Assemble the `build` argument vector. The context path for an empty
/// context is supplied by the caller (a fresh temp directory).
pub fn build_args(build: &BuildSpec, runtime: Runtime, context_dir: &str) -> Vec<String> {
    let mut args = vec![runtime.program().to_string(), "build".to_string()];

    match (&build.dockerfile, &build.dockerfile_content) {
        (Some(path), _) => {
            args.push("-f".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        (None, Some(_)) => {
            args.push("-f".to_string());
            args.push("-".to_string());
        }
        (None, None) => unreachable!("validated during spec resolution"),
    }

    if let Some(platform) = &build.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    for (key, value) in &build.args {
        args.push("--build-arg".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-t".to_string());
    args.push(build.tag.clone());
    args.push(context_dir.to_string());
    args
}

/// Build the image, returning the tag on success.
pub fn build_image(build: &BuildSpec, runtime: Runtime, dry_run: bool) -> CtenvResult<String> {
    let program = find_in_path(runtime.program()).ok_or_else(|| CtenvError::RuntimeNotFound {
        runtime: runtime.program().to_string(),
    })?;

    // The empty-context temp dir lives until the subprocess is done.
    let empty_context = match &build.context {
        BuildContext::Empty => Some(tempfile::tempdir().map_err(|source| CtenvError::Io {
            path: std::env::temp_dir(),
            source,
        })?),
        BuildContext::Dir(_) => None,
    };
    let context_dir = match (&build.context, &empty_context) {
        (BuildContext::Dir(dir), _) => dir.to_string_lossy().into_owned(),
        (BuildContext::Empty, Some(temp)) => temp.path().to_string_lossy().into_owned(),
        (BuildContext::Empty, None) => unreachable!(),
    };

    let args = build_args(build, runtime, &context_dir);
    if dry_run {
        println!("{}", shell::join(&args));
        return Ok(build.tag.clone());
    }

    tracing::debug!(command = %shell::join(&args), "running image build");

    let mut command = Command::new(&program);
    command.args(&args[1..]);
    if build.dockerfile_content.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().map_err(|source| CtenvError::Io {
        path: program.clone(),
        source,
    })?;

    if let Some(content) = &build.dockerfile_content {
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(content.as_bytes())
            .map_err(|source| CtenvError::Io {
                path: program.clone(),
                source,
            })?;
        // Dropping closes the pipe so the build can proceed.
        drop(stdin);
    }

    let status = child.wait().map_err(|source| CtenvError::Io {
        path: program,
        source,
    })?;

    if !status.success() {
        return Err(CtenvError::BuildFailure {
            code: status.code().unwrap_or(1),
        });
    }

    tracing::debug!(tag = %build.tag, "image built");
    Ok(build.tag.clone())
}
