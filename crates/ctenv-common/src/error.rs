//! Common error types for ctenv.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CtenvError`].
pub type CtenvResult<T> = Result<T, CtenvError>;

/// Errors across the ctenv pipeline.
///
/// Each variant corresponds to one failure kind a user can hit; nothing is
/// retried, everything is fatal except the container's own exit status,
/// which is forwarded instead of wrapped.
#[derive(Error, Diagnostic, Debug)]
pub enum CtenvError {
    /// A configuration file could not be opened or read.
    #[error("Cannot read config file {}: {reason}", .path.display())]
    #[diagnostic(code(ctenv::config::load))]
    ConfigLoad {
        /// The file that failed to load.
        path: PathBuf,
        /// The OS-level reason.
        reason: String,
    },

    /// A configuration file is not valid TOML.
    #[error("Invalid TOML in {}: {reason}", .path.display())]
    #[diagnostic(code(ctenv::config::parse))]
    ConfigParse {
        /// The file that failed to parse.
        path: PathBuf,
        /// The parser's message, including its span when available.
        reason: String,
    },

    /// A configuration file contains a key the schema does not know.
    #[error("Unknown key '{key}' in {scope} ({})", .path.display())]
    #[diagnostic(
        code(ctenv::config::schema),
        help("valid top-level keys are 'defaults' and 'containers'; run 'ctenv config show' to inspect recognized fields")
    )]
    ConfigSchema {
        /// The file containing the key.
        path: PathBuf,
        /// Where the key appeared ("top level", "defaults", "container 'dev'").
        scope: String,
        /// The offending key.
        key: String,
    },

    /// A configuration field has a value of the wrong shape.
    #[error("Invalid value for '{field}' in {scope}: expected {expected}, got {found}")]
    #[diagnostic(code(ctenv::config::wrong_type))]
    ConfigType {
        /// Where the field appeared.
        scope: String,
        /// The field name.
        field: String,
        /// What the schema expects.
        expected: String,
        /// What was found.
        found: String,
    },

    /// Semantic configuration conflict (e.g. build and image both set).
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ctenv::config::conflict))]
    Config {
        /// The conflict description.
        message: String,
    },

    /// The CLI named a container no config file defines.
    #[error("Unknown container '{name}'. Available: {available:?}")]
    #[diagnostic(code(ctenv::config::unknown_container))]
    UnknownContainer {
        /// The requested container name.
        name: String,
        /// Names that are defined.
        available: Vec<String>,
    },

    /// More than one container claims `default = true`.
    #[error("Multiple containers marked default = true: {names:?}")]
    #[diagnostic(
        code(ctenv::config::ambiguous_default),
        help("keep default = true on at most one container, or name one explicitly on the command line")
    )]
    AmbiguousDefault {
        /// The conflicting container names.
        names: Vec<String>,
    },

    /// A `${...}` reference could not be resolved.
    #[error("Cannot expand '{expression}' in field '{field}': {reason}")]
    #[diagnostic(code(ctenv::template))]
    Template {
        /// The template expression as written.
        expression: String,
        /// The field it appeared in.
        field: String,
        /// Why it failed (unknown variable, unknown filter).
        reason: String,
    },

    /// A volume specification does not match `HOST[:CONTAINER[:OPTS]]`.
    #[error("Invalid volume specification '{spec}': {reason}")]
    #[diagnostic(
        code(ctenv::volume::syntax),
        help("volumes use HOST[:CONTAINER[:OPTS]] where OPTS is a comma-separated subset of ro,rw,z,Z,chown")
    )]
    VolumeSyntax {
        /// The spec as written.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A referenced path does not exist or has the wrong kind.
    #[error("{message}: {}", .path.display())]
    #[diagnostic(code(ctenv::path))]
    Path {
        /// The missing or invalid path.
        path: PathBuf,
        /// What was expected of it.
        message: String,
    },

    /// The configured container runtime is not on PATH.
    #[error("Container runtime '{runtime}' not found in PATH")]
    #[diagnostic(
        code(ctenv::runtime::not_found),
        help("install docker or podman, or select the other runtime with --runtime")
    )]
    RuntimeNotFound {
        /// The runtime binary name.
        runtime: String,
    },

    /// The runtime's `build` subcommand returned nonzero.
    #[error("Image build failed with exit code {code}")]
    #[diagnostic(code(ctenv::build::failed))]
    BuildFailure {
        /// The build subprocess's exit code.
        code: i32,
    },

    /// The invoking uid or gid has no passwd/group entry.
    #[error("Cannot resolve host identity: {message}")]
    #[diagnostic(code(ctenv::identity))]
    Identity {
        /// What could not be resolved.
        message: String,
    },

    /// I/O error with the path involved.
    #[error("I/O error on {}: {source}", .path.display())]
    #[diagnostic(code(ctenv::io))]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CtenvError::UnknownContainer {
            name: "dev".to_string(),
            available: vec!["ci".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown container 'dev'. Available: [\"ci\"]"
        );
    }

    #[test]
    fn volume_syntax_display() {
        let err = CtenvError::VolumeSyntax {
            spec: ":/x".to_string(),
            reason: "host path cannot be empty".to_string(),
        };
        assert!(err.to_string().contains(":/x"));
        assert!(err.to_string().contains("host path"));
    }
}
