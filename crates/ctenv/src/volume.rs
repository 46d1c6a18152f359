//! Volume specification parsing.
//!
//! The grammar is `HOST[:CONTAINER[:OPTS]]` where `OPTS` is a
//! comma-separated list over a fixed vocabulary. The container component
//! stays `None` when omitted or empty so the resolver can tell an explicit
//! container path from a defaulted one.

use std::fmt;

use ctenv_common::{CtenvError, CtenvResult};

/// A mount option recognized in a volume spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOption {
    /// Read-only mount.
    ReadOnly,
    /// Read-write mount (the runtime default, accepted for symmetry).
    ReadWrite,
    /// SELinux shared relabel.
    SharedRelabel,
    /// SELinux private relabel.
    PrivateRelabel,
    /// ctenv-consumed: chown the container path to the target user.
    Chown,
}

impl VolumeOption {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ro" => Some(Self::ReadOnly),
            "rw" => Some(Self::ReadWrite),
            "z" => Some(Self::SharedRelabel),
            "Z" => Some(Self::PrivateRelabel),
            "chown" => Some(Self::Chown),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::SharedRelabel => "z",
            Self::PrivateRelabel => "Z",
            Self::Chown => "chown",
        };
        f.write_str(s)
    }
}

/// A parsed volume specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Host path or named-volume name. Never empty.
    pub host: String,
    /// Container path; `None` when the spec left it out (smart defaulting
    /// happens in the resolver).
    pub container: Option<String>,
    /// Options in written order.
    pub options: Vec<VolumeOption>,
}

impl VolumeSpec {
    /// Parse `HOST[:CONTAINER[:OPTS]]`.
    pub fn parse(spec: &str) -> CtenvResult<Self> {
        if spec.is_empty() {
            return Err(CtenvError::VolumeSyntax {
                spec: spec.to_string(),
                reason: "empty specification".to_string(),
            });
        }
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, opts_str) = match parts.as_slice() {
            [host] => (*host, None, ""),
            [host, container] => (*host, Some(*container), ""),
            [host, container, opts] => (*host, Some(*container), *opts),
            _ => {
                return Err(CtenvError::VolumeSyntax {
                    spec: spec.to_string(),
                    reason: "too many ':' separators".to_string(),
                })
            }
        };

        if host.is_empty() {
            return Err(CtenvError::VolumeSyntax {
                spec: spec.to_string(),
                reason: "host path cannot be empty".to_string(),
            });
        }

        let mut options = Vec::new();
        for opt in opts_str.split(',') {
            let opt = opt.trim();
            if opt.is_empty() {
                continue;
            }
            let parsed = VolumeOption::parse(opt).ok_or_else(|| CtenvError::VolumeSyntax {
                spec: spec.to_string(),
                reason: format!("unknown option '{opt}'"),
            })?;
            if !options.contains(&parsed) {
                options.push(parsed);
            }
        }

        // Empty CONTAINER component means "default it later".
        let container = container.filter(|c| !c.is_empty()).map(str::to_string);

        Ok(Self {
            host: host.to_string(),
            container,
            options,
        })
    }

    /// Whether the chown option is present.
    pub fn wants_chown(&self) -> bool {
        self.options.contains(&VolumeOption::Chown)
    }

    /// Render back to spec syntax (all components as written).
    pub fn to_spec_string(&self) -> String {
        let mut out = self.host.clone();
        match (&self.container, self.options.is_empty()) {
            (Some(c), true) => {
                out.push(':');
                out.push_str(c);
            }
            (Some(c), false) => {
                out.push(':');
                out.push_str(c);
                out.push(':');
                out.push_str(&join_options(&self.options));
            }
            (None, true) => {}
            (None, false) => {
                out.push_str("::");
                out.push_str(&join_options(&self.options));
            }
        }
        out
    }
}

fn join_options(options: &[VolumeOption]) -> String {
    options
        .iter()
        .map(VolumeOption::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// A volume after resolution: both sides concrete, chown already
/// extracted. This is what the runtime driver renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    /// Host path or named-volume name.
    pub host: String,
    /// Absolute container path.
    pub container: String,
    /// Options to pass to the runtime (never contains `chown`).
    pub options: Vec<VolumeOption>,
}

impl ResolvedVolume {
    /// Render as the runtime's `--volume` value.
    pub fn to_runtime_string(&self) -> String {
        let passed: Vec<VolumeOption> = self
            .options
            .iter()
            .copied()
            .filter(|o| *o != VolumeOption::Chown)
            .collect();
        if passed.is_empty() {
            format!("{}:{}", self.host, self.container)
        } else {
            format!("{}:{}:{}", self.host, self.container, join_options(&passed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_path() {
        let v = VolumeSpec::parse("/data").unwrap();
        assert_eq!(v.host, "/data");
        assert_eq!(v.container, None);
        assert!(v.options.is_empty());
    }

    #[test]
    fn parse_host_container() {
        let v = VolumeSpec::parse("/data:/mnt").unwrap();
        assert_eq!(v.host, "/data");
        assert_eq!(v.container.as_deref(), Some("/mnt"));
    }

    #[test]
    fn parse_with_options() {
        let v = VolumeSpec::parse("cache:/var/cache:ro,chown").unwrap();
        assert_eq!(v.host, "cache");
        assert_eq!(v.container.as_deref(), Some("/var/cache"));
        assert_eq!(
            v.options,
            vec![VolumeOption::ReadOnly, VolumeOption::Chown]
        );
        assert!(v.wants_chown());
    }

    #[test]
    fn empty_container_component_defaults_later() {
        let v = VolumeSpec::parse("/data::ro").unwrap();
        assert_eq!(v.container, None);
        assert_eq!(v.options, vec![VolumeOption::ReadOnly]);
    }

    #[test]
    fn empty_host_is_rejected() {
        assert!(VolumeSpec::parse(":/mnt").is_err());
        assert!(VolumeSpec::parse("").is_err());
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = VolumeSpec::parse("/a:/b:bogus").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn too_many_colons_rejected() {
        assert!(VolumeSpec::parse("/a:/b:ro:extra").is_err());
    }

    #[test]
    fn spec_string_round_trip() {
        for s in ["/data", "/data:/mnt", "/data:/mnt:ro,z", "cache:/var/cache:chown"] {
            let v = VolumeSpec::parse(s).unwrap();
            assert_eq!(v.to_spec_string(), s);
        }
    }

    #[test]
    fn runtime_string_strips_chown() {
        let v = ResolvedVolume {
            host: "cache".to_string(),
            container: "/var/cache".to_string(),
            options: vec![VolumeOption::Chown],
        };
        assert_eq!(v.to_runtime_string(), "cache:/var/cache");

        let v = ResolvedVolume {
            host: "/a".to_string(),
            container: "/b".to_string(),
            options: vec![VolumeOption::ReadOnly, VolumeOption::Chown],
        };
        assert_eq!(v.to_runtime_string(), "/a:/b:ro");
    }
}
