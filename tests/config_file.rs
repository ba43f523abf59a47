//! The bundled `tuner.toml` must stay loadable and clean.

use std::path::Path;

use shooter_tuner::config::loader::load_from_file;
use shooter_tuner::config::PolicySetting;

#[test]
fn test_bundled_config_loads_without_warnings() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tuner.toml");
    let loaded = load_from_file(&path).expect("test: tuner.toml loads");
    assert!(loaded.warnings.is_empty(), "{:?}", loaded.warnings);

    let cfg = loaded.config;
    let enabled: Vec<&str> = cfg
        .enabled_coefficients_in_order()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(
        enabled,
        vec![
            "kDragCoefficient",
            "kShooterAngle",
            "kShooterRPM",
            "kExitVelocity"
        ]
    );

    let rpm = cfg.coefficient("kShooterRPM").expect("test: rpm defined");
    assert!(rpm.is_integer);
    assert_eq!(
        rpm.effective_autotune_settings(&cfg.autotune),
        PolicySetting {
            enabled: true,
            shot_threshold: 15
        }
    );
    assert_eq!(cfg.network.server_address(), "10.58.92.2");
    assert!(cfg.interlocks.require_shot_logged);
}
