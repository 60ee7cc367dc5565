//! `Config::load` merge-order tests: YAML file, then `DELIVERY_`-prefixed
//! environment overrides, then the `DATABASE_URL`/`DELIVERY_ENCRYPTION_KEY`
//! special cases. Mutates process-global environment variables, so these run
//! `#[serial]` to avoid racing other tests in this binary over the same keys.

use delivery_core::config::{Args, Config};
use serial_test::serial;
use std::io::Write;

fn write_config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
    file.write_all(contents.as_bytes()).expect("write temp config file");
    file
}

fn clear_env() {
    for key in ["DATABASE_URL", "DELIVERY_ENCRYPTION_KEY", "DELIVERY_LOG_FILTER", "DELIVERY_QUEUE__WORKERS"] {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
#[serial]
fn yaml_values_are_loaded() {
    clear_env();
    let file = write_config_file("database:\n  url: postgres://localhost/delivery\nlog_filter: debug\n");
    let args = Args {
        config: file.path().to_string_lossy().to_string(),
        validate: false,
    };

    let config = Config::load(&args).expect("load config");
    assert_eq!(config.database.url, "postgres://localhost/delivery");
    assert_eq!(config.log_filter, "debug");
    clear_env();
}

#[test]
#[serial]
fn environment_overrides_take_precedence_over_yaml() {
    clear_env();
    let file = write_config_file("database:\n  url: postgres://localhost/delivery\nlog_filter: info\n");
    unsafe { std::env::set_var("DELIVERY_LOG_FILTER", "trace") };
    unsafe { std::env::set_var("DELIVERY_QUEUE__WORKERS", "9") };

    let args = Args {
        config: file.path().to_string_lossy().to_string(),
        validate: false,
    };
    let config = Config::load(&args).expect("load config");

    assert_eq!(config.log_filter, "trace");
    assert_eq!(config.queue.workers, 9);
    clear_env();
}

#[test]
#[serial]
fn database_url_env_var_overrides_yaml_as_a_special_case() {
    clear_env();
    let file = write_config_file("database:\n  url: postgres://localhost/delivery\n");
    unsafe { std::env::set_var("DATABASE_URL", "postgres://override/delivery") };

    let args = Args {
        config: file.path().to_string_lossy().to_string(),
        validate: false,
    };
    let config = Config::load(&args).expect("load config");

    assert_eq!(config.database.url, "postgres://override/delivery");
    clear_env();
}

#[test]
#[serial]
fn missing_database_url_fails_validation() {
    clear_env();
    let file = write_config_file("log_filter: info\n");
    let args = Args {
        config: file.path().to_string_lossy().to_string(),
        validate: false,
    };

    let result = Config::load(&args);
    assert!(result.is_err());
    clear_env();
}

#[test]
#[serial]
fn malformed_encryption_key_fails_validation() {
    clear_env();
    let file = write_config_file("database:\n  url: postgres://localhost/delivery\nsecrets:\n  enabled: true\n");
    unsafe { std::env::set_var("DELIVERY_ENCRYPTION_KEY", "not-hex") };

    let args = Args {
        config: file.path().to_string_lossy().to_string(),
        validate: false,
    };
    let result = Config::load(&args);
    assert!(result.is_err());
    clear_env();
}
