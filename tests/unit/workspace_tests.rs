use std::fs;

use botfoundry::config::GlobalConfig;
use botfoundry::supervisor::workspace;

fn test_config(root: &std::path::Path) -> GlobalConfig {
    let toml = format!(
        r#"
storage_root = '{root}'
worker_command = "/bin/sleep"
"#,
        root = root.to_str().expect("utf8"),
    );
    GlobalConfig::from_toml_str(&toml).expect("valid config")
}

#[test]
fn paths_derive_from_storage_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    let paths = workspace::paths(&config, "inst-1");
    assert_eq!(paths.dir, temp.path().join("instances").join("inst-1"));
    assert_eq!(paths.data_file, paths.dir.join("data.json"));
    assert_eq!(paths.heartbeat_file, paths.dir.join("heartbeat"));
}

#[test]
fn prepare_creates_dir_and_seeds_data_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    let paths = workspace::prepare(&config, "inst-1").expect("prepare");
    assert!(paths.dir.is_dir());
    assert_eq!(fs::read_to_string(&paths.data_file).expect("read"), "{}");
    assert!(
        !paths.heartbeat_file.exists(),
        "heartbeat is the worker's to create"
    );
}

#[test]
fn prepare_preserves_existing_data_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    let paths = workspace::prepare(&config, "inst-1").expect("first prepare");
    fs::write(&paths.data_file, r#"{"counter": 42}"#).expect("write state");

    workspace::prepare(&config, "inst-1").expect("second prepare");
    assert_eq!(
        fs::read_to_string(&paths.data_file).expect("read"),
        r#"{"counter": 42}"#,
        "restart must not reprovision the data file"
    );
}

#[test]
fn remove_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    let paths = workspace::prepare(&config, "inst-1").expect("prepare");
    assert!(paths.dir.exists());

    workspace::remove(&config, "inst-1").expect("first remove");
    assert!(!paths.dir.exists());
    assert!(!paths.data_file.exists());

    // Re-running an interrupted cleanup must succeed.
    workspace::remove(&config, "inst-1").expect("second remove");
}

#[test]
fn remove_unknown_instance_is_a_no_op() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());

    workspace::remove(&config, "never-existed").expect("remove");
}
