#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;
    use zola_telemetry::config::apply_env_overrides;
    use zola_telemetry::{load_config, Error, InitConfig, ManualClock, Pipeline, PipelineConfig, Severity};

    #[test]
    fn test_init_config_defaults() {
        let init = InitConfig::default();
        assert_eq!(init.log_filter, "info");
        assert!(init.enable_metrics);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("telemetry.toml");

        let mut config = PipelineConfig::default();
        config.tracing.sample_rate = 0.5;
        config.notifications.max_attempts = 5;
        config.errors.notify_min_severity = Severity::Critical;
        fs::write(&path, toml::to_string(&config).expect("serialize config")).expect("write config");

        let loaded = load_config(&path).expect("config loads");
        assert_eq!(loaded.tracing.sample_rate, 0.5);
        assert_eq!(loaded.notifications.max_attempts, 5);
        assert_eq!(loaded.errors.notify_min_severity, Severity::Critical);
        assert_eq!(loaded.dispatcher.queue_capacity, config.dispatcher.queue_capacity);
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let dir = tempdir().expect("temp dir");
        let result = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    // Environment variables are process-wide, so every override case lives in this one test
    #[test]
    fn test_environment_overrides() {
        std::env::set_var("ZOLA_TELEMETRY_SAMPLE_RATE", "0.1");
        std::env::set_var("ZOLA_TELEMETRY_LOG_MAX_ENTRIES", "lots");
        std::env::set_var("ZOLA_TELEMETRY_FINGERPRINT_SALT", "tenant-7");

        let mut config = PipelineConfig::default();
        let rejected = apply_env_overrides(&mut config);

        std::env::remove_var("ZOLA_TELEMETRY_SAMPLE_RATE");
        std::env::remove_var("ZOLA_TELEMETRY_LOG_MAX_ENTRIES");
        std::env::remove_var("ZOLA_TELEMETRY_FINGERPRINT_SALT");

        assert_eq!(config.tracing.sample_rate, 0.1);
        assert_eq!(config.errors.fingerprint_salt, "tenant-7");
        assert_eq!(config.logs.max_entries, PipelineConfig::default().logs.max_entries);
        assert_eq!(rejected, vec!["ZOLA_TELEMETRY_LOG_MAX_ENTRIES=lots".to_string()]);
    }

    #[test]
    fn test_pipeline_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.dispatcher.queue_capacity = 0;
        assert!(Pipeline::with_clock(config, Arc::new(ManualClock::at_epoch_2024())).is_err());
    }

    #[test]
    fn test_start_requires_runtime() {
        let pipeline = Pipeline::with_clock(PipelineConfig::default(), Arc::new(ManualClock::at_epoch_2024()))
            .expect("valid config");
        assert!(pipeline.start().is_err());
        assert!(!pipeline.is_running());
    }
}
