//! ctenv - run a command in a container as the current user.
//!
//! The pipeline, leaves first: capture a [`context::RuntimeContext`], load
//! and merge [`config`] layers, expand [`template`] variables, resolve the
//! merged record into a concrete [`spec::ContainerSpec`], generate the
//! privilege-dropping [`entrypoint`] script, optionally [`build`] the
//! image, and hand everything to the [`runner`].

pub mod build;
pub mod cli;
pub mod config;
pub mod context;
pub mod entrypoint;
pub mod runner;
pub mod spec;
pub mod template;
pub mod volume;

/// Fixed in-container mount point for the privilege-drop helper.
pub const GOSU_MOUNT: &str = "/ctenv/gosu";

/// Fixed in-container mount point for the generated entrypoint script.
pub const ENTRYPOINT_MOUNT: &str = "/ctenv/entrypoint.sh";

/// Config file name searched for in the home directory and project tree.
pub const CONFIG_FILE_NAME: &str = ".ctenv.toml";
