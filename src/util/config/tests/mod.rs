//! Config 单元测试
//!
//! 测试配置的默认值、TOML 解析、环境覆盖和校验

use std::io::Write;

use crate::runtime::scheduler::ExecutorKind;
use crate::runtime::task::TaskPriority;
use crate::util::config::{save_config, ConfigError, RuntimeConfig};

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.executor, ExecutorKind::ThreadPool);
        assert!(config.workers >= 1);
        assert_eq!(config.default_priority, TaskPriority::UNSPECIFIED);
        assert_eq!(config.slab_size, 1024);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_takes_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.executor, ExecutorKind::ThreadPool);
        assert_eq!(config.slab_size, 1024);
    }

    #[test]
    fn test_parse_full_document() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            executor = "thread_per_task"
            workers = 3
            default_priority = 25
            slab_size = 4096
            log_level = "weft=trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.executor, ExecutorKind::ThreadPerTask);
        assert_eq!(config.workers, 3);
        assert_eq!(config.default_priority, TaskPriority::HIGH);
        assert_eq!(config.slab_size, 4096);
        assert_eq!(config.log_level, "weft=trace");
    }

    #[test]
    fn test_parse_error() {
        let err = RuntimeConfig::from_toml_str("executor = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_unknown_executor_is_parse_error() {
        let err = RuntimeConfig::from_toml_str("executor = \"green\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = RuntimeConfig::from_toml_str("workers = 0").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "workers"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_rejects_tiny_slabs() {
        let err = RuntimeConfig::from_toml_str("slab_size = 8").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "slab_size", .. }));
    }

    #[test]
    fn test_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(Some("coop"), Some(" 2 "))
            .unwrap();
        assert_eq!(config.executor, ExecutorKind::Cooperative);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_overrides_reject_garbage() {
        let mut config = RuntimeConfig::default();
        let err = config.apply_overrides(Some("fibers"), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "WEFT_EXECUTOR", .. }));

        let err = config.apply_overrides(None, Some("many")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "WEFT_WORKERS", .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "executor = \"cooperative\"").unwrap();
        writeln!(file, "workers = 2").unwrap();

        let config = RuntimeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.executor, ExecutorKind::Cooperative);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::load_from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weft.toml");
        let config = RuntimeConfig {
            executor: ExecutorKind::ThreadPerTask,
            workers: 5,
            default_priority: TaskPriority::UTILITY,
            slab_size: 2048,
            log_level: "debug".to_string(),
        };

        save_config(&config, &path).unwrap();
        let loaded = RuntimeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
