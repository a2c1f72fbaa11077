//! Unit tests for the config module

#[cfg(test)]
mod tests {
    use crate::config::{self, Config, SessionConfig};
    use crate::constants::CAPTURE_FRAME_SIZE;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.audio.frame_size, CAPTURE_FRAME_SIZE);
        assert_eq!(config.session.voice, "Puck");
        assert!(config.session.endpoint.starts_with("wss://"));
        assert_eq!(config.session.open_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = config::parse(
            r#"
            [session]
            voice = "Kore"

            [audio]
            input_device = "USB"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.voice, "Kore");
        assert_eq!(config.session.model, SessionConfig::default().model);
        assert_eq!(config.audio.input_device.as_deref(), Some("USB"));
        assert_eq!(config.audio.output_device, None);
        assert_eq!(config.audio.frame_size, CAPTURE_FRAME_SIZE);
    }

    #[test]
    fn test_parse_empty_file() {
        assert_eq!(config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_zero_frame_size_is_rejected() {
        let result = config::parse("[audio]\nframe_size = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_model_is_rejected() {
        let result = config::parse("[session]\nmodel = \"  \"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = config::parse("[session\nvoice = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_url_appends_key() {
        let mut session = SessionConfig {
            endpoint: "wss://example.com/live".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(session.url(), "wss://example.com/live");

        session.api_key = Some("secret".to_string());
        assert_eq!(session.url(), "wss://example.com/live?key=secret");

        session.endpoint = "wss://example.com/live?alt=json".to_string();
        assert_eq!(session.url(), "wss://example.com/live?alt=json&key=secret");
    }

    #[test]
    fn test_empty_key_is_not_appended() {
        let session = SessionConfig {
            endpoint: "ws://localhost:1".to_string(),
            api_key: Some(String::new()),
            ..SessionConfig::default()
        };
        assert_eq!(session.url(), "ws://localhost:1");
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = config::load_from(dir.path().join("Config.toml"))
            .await
            .unwrap();

        // The API key may come from the environment
        assert_eq!(config.audio, Config::default().audio);
        assert_eq!(config.session.model, SessionConfig::default().model);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nopen_timeout_secs = 3\n[audio]\nframe_size = 2048").unwrap();

        let config = config::load_from(file.path()).await.unwrap();

        assert_eq!(config.session.open_timeout_secs, 3);
        assert_eq!(config.audio.frame_size, 2048);
    }
}
