//! Settings loading and logging setup as seen by an application.

use daq_dataset::config::Settings;
use daq_dataset::data::dataset::DataSetBuilder;
use daq_dataset::logging::{self, OutputFormat, TracingConfig};
use figment::Jail;
use tracing::Level;

#[test]
fn test_default_config_file_drives_builder() {
    Jail::expect_with(|jail| {
        std::fs::create_dir_all("config").map_err(|e| e.to_string())?;
        jail.create_file(
            "config/default.toml",
            r##"
            log_level = "warn"

            [storage]
            base_location = "measurements"
            location_format = "#{counter}_{name}"
            default_formatter = "gnuplot"
            "##,
        )?;
        jail.set_env("DAQ_DATASET_STORAGE__WRITE_PERIOD_SECS", "0.5");

        let settings = Settings::load().map_err(|e| e.to_string())?;
        settings.validate().map_err(|e| e.to_string())?;
        assert_eq!(settings.write_period(), Some(std::time::Duration::from_millis(500)));

        let data_set = DataSetBuilder::from_settings(&settings)
            .map_err(|e| e.to_string())?
            .name("sweep")
            .build()
            .map_err(|e| e.to_string())?;
        assert_eq!(data_set.location(), Some("#001_sweep"));
        assert_eq!(data_set.formatter().name(), "gnuplot");
        assert_eq!(
            data_set.io().base_location(),
            std::path::Path::new("measurements")
        );
        Ok(())
    });
}

#[test]
fn test_invalid_env_override_is_reported() {
    Jail::expect_with(|jail| {
        jail.set_env("DAQ_DATASET_STORAGE__DEFAULT_FORMATTER", "netcdf");
        let settings = Settings::load().map_err(|e| e.to_string())?;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("netcdf"));
        Ok(())
    });
}

#[test]
fn test_logging_init_is_idempotent() {
    let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config).is_ok());
    assert!(logging::init_from_settings(&Settings::default()).is_ok());

    let mut settings = Settings::default();
    settings.log_level = "loud".to_string();
    assert!(TracingConfig::from_settings(&settings).is_err());
}
