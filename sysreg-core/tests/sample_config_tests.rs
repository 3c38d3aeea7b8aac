use serial_test::serial;
use std::time::Duration;

use sysreg_core::config::{RunConfiguration, OUTPUT_DIR_ENV};
use sysreg_core::types::BackendKind;

const SAMPLE: &str = include_str!("../../sysreg.example.toml");

#[test]
#[serial]
fn test_sample_configuration_loads() {
    std::env::set_var(OUTPUT_DIR_ENV, "output-test");
    let config = RunConfiguration::from_toml_str(SAMPLE).unwrap();
    std::env::remove_var(OUTPUT_DIR_ENV);

    assert_eq!(config.backend, BackendKind::Kvm);
    assert_eq!(config.stages.len(), 3);
    assert_eq!(config.console_timeout(), Some(Duration::from_secs(180)));
    assert!(config.global_deadline.is_some());
    assert!(config.stages.iter().all(|s| s.checkpoint.is_some()));
    assert_eq!(config.output_dir.to_str(), Some("output-test"));
}

#[test]
#[serial]
fn test_sample_configuration_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sysreg.toml");
    std::fs::write(&path, SAMPLE.replace("backend = \"kvm\"", "backend = \"VirtualBox\"")).unwrap();

    let config = RunConfiguration::from_file(&path).unwrap();
    assert_eq!(config.backend, BackendKind::VirtualBox);
    assert_eq!(config.stages[0].boot_device, "cdrom");
}
