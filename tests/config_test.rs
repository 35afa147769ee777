//! Layered configuration feeding the camera facade.

use figment::Jail;
use indi_camera::{Camera, CameraConfig, MockTransport};
use std::sync::Arc;

#[test]
fn test_camera_from_toml_and_env() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "camera.toml",
            r#"
            [device]
            name = "ZWO CCD ASI120MM"
            max_retries = 1

            [sequence]
            finish_poll_ms = 20
            "#,
        )?;
        jail.set_env("INDICAM_LOGGING__LEVEL", "debug");

        let camera = Camera::from_config(Arc::new(MockTransport::new()), Some("camera.toml"))
            .map_err(|e| e.to_string())?;
        let config = camera.config();
        assert_eq!(config.device.name, "ZWO CCD ASI120MM");
        assert_eq!(config.device.max_retries, 1);
        assert_eq!(config.sequence.finish_poll_ms, 20);
        assert_eq!(config.sequence.start_poll_ms, 10);
        assert_eq!(config.logging.level, "debug");
        Ok(())
    });
}

#[test]
fn test_invalid_file_rejected() {
    Jail::expect_with(|jail| {
        jail.create_file("camera.toml", "[sequence]\nstart_poll_ms = 0\n")?;
        let err = Camera::from_config(Arc::new(MockTransport::new()), Some("camera.toml"));
        assert!(err.is_err());
        Ok(())
    });
}

#[test]
fn test_default_config_is_valid() {
    assert!(CameraConfig::default().validate().is_ok());
}
