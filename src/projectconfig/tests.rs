use serial_test::serial;
use tempfile::TempDir;

use super::*;

const SAMPLE: &str = r#"
[global.config]
region = "inline://ImV1LXdlc3Qi"
timeout = "inline://MzA="

[global.secrets]
token = "secrets://token"

[modules.svc.config]
timeout = "env://SVC_TIMEOUT"

[modules.svc.secrets]
password = "secrets://svc.password"
"#;

#[test]
fn test_accessor_round_trip() {
    for text in ["inline://aGVsbG8=", "env://HOME", "secrets://svc.password"] {
        let accessor: Accessor = text.parse().unwrap();
        assert_eq!(accessor.to_string(), text);
    }
    assert_eq!(
        "inline://aGVsbG8=".parse::<Accessor>().unwrap(),
        Accessor::inline(b"hello")
    );
}

#[test]
fn test_invalid_accessors() {
    for text in ["plain", "inline://!!", "env://", "secrets://a.b.c", "vault://x"] {
        assert!(text.parse::<Accessor>().is_err(), "{text}");
    }
}

#[test]
fn test_module_overrides_global() {
    let config = ProjectConfig::parse(SAMPLE).unwrap();

    let configs = config.configs_for("svc").unwrap();
    assert_eq!(configs["region"], Accessor::inline(b"\"eu-west\""));
    assert_eq!(configs["timeout"], Accessor::Env("SVC_TIMEOUT".to_string()));

    let other = config.configs_for("other").unwrap();
    assert_eq!(other["timeout"], Accessor::inline(b"30"));

    let secrets = config.secrets_for("svc").unwrap();
    assert_eq!(secrets.len(), 2);
    assert_eq!(
        secrets["password"],
        Accessor::Secret(Ref::module("svc", "password"))
    );
}

#[test]
fn test_parse_rejects_bad_accessor() {
    let err = ProjectConfig::parse("[global.config]\nx = \"nope\"\n").unwrap_err();
    assert!(matches!(err, ProjectConfigError::InvalidAccessor(_)));
}

#[test]
#[serial]
fn test_env_accessor_resolves() {
    std::env::set_var("PROJECTCONFIG_TEST_VALUE", "42");
    assert_eq!(
        Accessor::Env("PROJECTCONFIG_TEST_VALUE".to_string()).resolve().unwrap(),
        b"42"
    );
    std::env::remove_var("PROJECTCONFIG_TEST_VALUE");
    assert!(matches!(
        Accessor::Env("PROJECTCONFIG_TEST_VALUE".to_string()).resolve(),
        Err(ProjectConfigError::EnvNotSet(_))
    ));
}

#[test]
fn test_edit_and_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("project.toml");
    let mut config = ProjectConfig::load(&path).unwrap();
    assert_eq!(config, ProjectConfig::default());

    config.set_config(Some("svc"), "limit", &Accessor::inline(b"10"));
    config.set_secret(None, "token", &Ref::global("token"));
    config.save(&path).unwrap();

    let reloaded = ProjectConfig::load(&path).unwrap();
    assert_eq!(reloaded, config);
    assert!(reloaded.modules["svc"].secrets.is_empty());

    let mut edited = reloaded;
    assert!(edited.unset_config(Some("svc"), "limit"));
    assert!(!edited.unset_config(Some("svc"), "limit"));
    assert!(edited.unset_secret(None, "token"));
}
