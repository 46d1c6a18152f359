//! Integration tests for config loading, layering, and shadowing across
//! real files.

use std::path::{Path, PathBuf};

use ctenv::config::{ContainerConfig, CtenvConfig, Layered};
use ctenv::context::RuntimeContext;
use ctenv_common::CtenvError;
use tempfile::tempdir;

fn context_for(home: &Path, cwd: &Path) -> RuntimeContext {
    RuntimeContext {
        user_name: "alice".to_string(),
        user_id: 1234,
        user_home: home.to_path_buf(),
        group_name: "alice".to_string(),
        group_id: 1234,
        cwd: cwd.to_path_buf(),
        project_dir: cwd.to_path_buf(),
        pid: 4242,
        tty: false,
    }
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[test]
fn user_and_project_defaults_layer() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("work/app");
    write(
        &home.join(".ctenv.toml"),
        "[defaults]\nimage = \"user:1\"\nsudo = true\n",
    );
    write(
        &project.join(".ctenv.toml"),
        "[defaults]\nimage = \"project:1\"\n",
    );

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();

    // Project defaults override user defaults field by field; untouched
    // fields survive from the user scope.
    assert_eq!(
        config.defaults.image.value().map(String::as_str),
        Some("project:1")
    );
    assert_eq!(config.defaults.sudo.value(), Some(&true));
    assert_eq!(config.files.len(), 2);
}

#[test]
fn project_container_fully_shadows_user_container() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("work/app");
    write(
        &home.join(".ctenv.toml"),
        r#"
[containers.dev]
image = "user-dev:1"
volumes = ["/user/cache:/cache"]
env = ["USER_SCOPE=1"]
"#,
    );
    write(
        &project.join(".ctenv.toml"),
        "[containers.dev]\nimage = \"project-dev:1\"\n",
    );

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    let dev = &config.containers["dev"];

    // Atomic replacement: no field from the user-scope record survives.
    assert_eq!(dev.image.value().map(String::as_str), Some("project-dev:1"));
    assert!(dev.volumes.is_unset());
    assert!(dev.env.is_unset());
}

#[test]
fn notset_in_higher_layer_clears_lower_value() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("work/app");
    write(
        &home.join(".ctenv.toml"),
        "[defaults]\nnetwork = \"bridge\"\n",
    );
    write(
        &project.join(".ctenv.toml"),
        "[defaults]\nnetwork = \"NOTSET\"\n",
    );

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    assert_eq!(config.defaults.network, Layered::Null);
}

#[test]
fn explicit_files_suppress_discovery() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("work/app");
    write(
        &home.join(".ctenv.toml"),
        "[defaults]\nimage = \"discovered:1\"\n",
    );
    std::fs::create_dir_all(&project).unwrap();
    let explicit = temp.path().join("explicit.toml");
    write(&explicit, "[defaults]\nimage = \"explicit:1\"\n");

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[explicit.clone()]).unwrap();
    assert_eq!(
        config.defaults.image.value().map(String::as_str),
        Some("explicit:1")
    );
    assert_eq!(config.files, vec![explicit]);
}

#[test]
fn missing_explicit_file_is_load_error() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    let ctx = context_for(&home, temp.path());
    let err = CtenvConfig::load(&ctx, &[PathBuf::from("/no/such/file.toml")]).unwrap_err();
    assert!(matches!(err, CtenvError::ConfigLoad { .. }));
}

#[test]
fn named_container_selection_and_unknown_error() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("p");
    write(
        &project.join(".ctenv.toml"),
        "[containers.dev]\nimage = \"dev:1\"\n",
    );
    std::fs::create_dir_all(&home).unwrap();

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();

    let merged = config
        .resolve(Some("dev"), ContainerConfig::default())
        .unwrap();
    assert_eq!(merged.image.value().map(String::as_str), Some("dev:1"));

    let err = config
        .resolve(Some("nope"), ContainerConfig::default())
        .unwrap_err();
    assert!(matches!(err, CtenvError::UnknownContainer { .. }));
}

#[test]
fn single_default_container_is_selected_when_unnamed() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("p");
    write(
        &project.join(".ctenv.toml"),
        r#"
[containers.dev]
image = "dev:1"
default = true

[containers.ci]
image = "ci:1"
"#,
    );
    std::fs::create_dir_all(&home).unwrap();

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    let merged = config.resolve(None, ContainerConfig::default()).unwrap();
    assert_eq!(merged.image.value().map(String::as_str), Some("dev:1"));
}

#[test]
fn two_default_containers_are_ambiguous() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("p");
    write(
        &project.join(".ctenv.toml"),
        r#"
[containers.dev]
default = true

[containers.ci]
default = true
"#,
    );
    std::fs::create_dir_all(&home).unwrap();

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    let err = config.resolve(None, ContainerConfig::default()).unwrap_err();
    assert!(matches!(err, CtenvError::AmbiguousDefault { names } if names.len() == 2));

    // A CLI-supplied name takes precedence over the ambiguity.
    assert!(config
        .resolve(Some("ci"), ContainerConfig::default())
        .is_ok());
}

#[test]
fn cli_name_beats_default_marking() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("p");
    write(
        &project.join(".ctenv.toml"),
        r#"
[containers.dev]
image = "dev:1"
default = true

[containers.ci]
image = "ci:1"
"#,
    );
    std::fs::create_dir_all(&home).unwrap();

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    let merged = config
        .resolve(Some("ci"), ContainerConfig::default())
        .unwrap();
    assert_eq!(merged.image.value().map(String::as_str), Some("ci:1"));
}

#[test]
fn file_relative_paths_resolve_against_their_file() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let user_dir = &home;
    let project = temp.path().join("p");
    write(
        &user_dir.join(".ctenv.toml"),
        "[containers.a]\nvolumes = [\"./user-cache:/cache\"]\n",
    );
    write(
        &project.join(".ctenv.toml"),
        "[containers.b]\nvolumes = [\"./proj-cache:/cache\"]\n",
    );

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();

    assert_eq!(
        config.containers["a"].volumes.value().unwrap()[0],
        format!("{}/user-cache:/cache", home.display())
    );
    assert_eq!(
        config.containers["b"].volumes.value().unwrap()[0],
        format!("{}/proj-cache:/cache", project.display())
    );
}

#[test]
fn cli_overrides_sit_on_top() {
    let temp = tempdir().unwrap();
    let home = temp.path().join("home");
    let project = temp.path().join("p");
    write(
        &project.join(".ctenv.toml"),
        "[containers.dev]\nimage = \"dev:1\"\nsudo = true\n",
    );
    std::fs::create_dir_all(&home).unwrap();

    let cli = ContainerConfig {
        image: Layered::Value("cli:1".to_string()),
        ..Default::default()
    };

    let ctx = context_for(&home, &project);
    let config = CtenvConfig::load(&ctx, &[]).unwrap();
    let merged = config.resolve(Some("dev"), cli).unwrap();
    assert_eq!(merged.image.value().map(String::as_str), Some("cli:1"));
    assert_eq!(merged.sudo.value(), Some(&true));
}
