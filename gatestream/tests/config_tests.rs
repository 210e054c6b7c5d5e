use std::io::Write;

use gatestream::{GateStreamError, GatewayConfig};

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
host = "0.0.0.0"
port = 9443
path = "/n3n/agent/secure"
replay_tolerance_ms = 60000
"#
    )
    .unwrap();

    let cfg = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(cfg.bind_addr(), "0.0.0.0:9443");
    assert_eq!(cfg.path, "/n3n/agent/secure");
    assert_eq!(cfg.replay_tolerance_ms, 60_000);
    assert_eq!(cfg.handshake_timeout_ms, 10_000);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        GatewayConfig::load(dir.path().join("absent.toml")),
        Err(GateStreamError::Io(_))
    ));
}

#[test]
fn bad_types_are_config_errors() {
    assert!(matches!(
        GatewayConfig::from_toml_str("port = \"eighty\""),
        Err(GateStreamError::Config(_))
    ));
}
