// Settings - the numeric half of the engine configuration
//
// Loadable from a TOML file with environment overrides (prefix JOBFORGE,
// e.g. JOBFORGE_ENGINE__THREADS_COUNT=4). Callbacks are not part of the
// settings model; register them on the resulting `JobsConfig`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tokio::time::Duration;

use crate::domain::{JobGroup, JobType, Priority};
use crate::error::EngineError;
use crate::sync::PrioConfig;

use super::config::{EngineConfig, GroupConfig, JobsConfig, TypeConfig};
use super::constants::DEFAULT_ENGINE_THREADS;

#[derive(Debug, Clone, Deserialize)]
pub struct PrioritySetting {
    pub priority: Priority,
    pub ratio: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub threads_count: usize,
    /// Empty means the default priority table.
    pub priorities: Vec<PrioritySetting>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            threads_count: DEFAULT_ENGINE_THREADS,
            priorities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub threads_count: usize,
    pub bulk_count: usize,
    pub delay_next_request_ms: Option<u64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            threads_count: super::constants::DEFAULT_GROUP_THREADS,
            bulk_count: super::constants::DEFAULT_BULK_COUNT,
            delay_next_request_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeSettings {
    pub group: String,
    pub timeout_ms: Option<u64>,
}

/// File/env loadable engine settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub groups: HashMap<String, GroupSettings>,
    pub types: HashMap<String, TypeSettings>,
}

impl Settings {
    /// Load from an optional TOML file, then apply `JOBFORGE_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("JOBFORGE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .map_err(|err| EngineError::Config(err.to_string()))?
            .try_deserialize()
            .map_err(|err| EngineError::Config(err.to_string()))
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(source: &str) -> Result<Self, EngineError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .map_err(|err| EngineError::Config(err.to_string()))?
            .try_deserialize()
            .map_err(|err| EngineError::Config(err.to_string()))
    }

    /// Build a callback-less [`JobsConfig`] out of these settings.
    pub fn into_config<R, S>(self) -> JobsConfig<R, S> {
        let prio_config = if self.engine.priorities.is_empty() {
            PrioConfig::default()
        } else {
            PrioConfig {
                levels: self
                    .engine
                    .priorities
                    .iter()
                    .map(|setting| (setting.priority, setting.ratio))
                    .collect(),
            }
        };

        let mut config = JobsConfig::new(EngineConfig {
            threads_count: self.engine.threads_count,
            prio_config,
        });

        for (name, group) in self.groups {
            let mut group_config =
                GroupConfig::new(group.threads_count).with_bulk_count(group.bulk_count);
            if let Some(delay_ms) = group.delay_next_request_ms {
                group_config =
                    group_config.with_delay_next_request(Duration::from_millis(delay_ms));
            }
            config = config.with_group(JobGroup::new(name), group_config);
        }

        for (name, type_settings) in self.types {
            let mut type_config = TypeConfig::new(JobGroup::new(type_settings.group));
            if let Some(timeout_ms) = type_settings.timeout_ms {
                type_config = type_config.with_timeout(Duration::from_millis(timeout_ms));
            }
            config = config.with_type(JobType::new(name), type_config);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engine]
        threads_count = 4
        priorities = [
            { priority = "HIGH", ratio = 3 },
            { priority = "NORMAL", ratio = 3 },
            { priority = "LOW", ratio = 0 },
        ]

        [groups.database]
        threads_count = 2
        bulk_count = 8
        delay_next_request_ms = 10

        [groups.web]
        threads_count = 1

        [types.select]
        group = "database"
        timeout_ms = 500

        [types.fetch]
        group = "web"
    "#;

    #[test]
    fn test_from_toml_parses_all_sections() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.engine.threads_count, 4);
        assert_eq!(settings.engine.priorities.len(), 3);
        assert_eq!(settings.engine.priorities[0].priority, Priority::High);
        assert_eq!(settings.engine.priorities[2].ratio, 0);

        let database = &settings.groups["database"];
        assert_eq!(database.threads_count, 2);
        assert_eq!(database.bulk_count, 8);
        assert_eq!(database.delay_next_request_ms, Some(10));

        // unspecified fields fall back to defaults
        assert_eq!(settings.groups["web"].bulk_count, 1);

        assert_eq!(settings.types["select"].group, "database");
        assert_eq!(settings.types["select"].timeout_ms, Some(500));
        assert_eq!(settings.types["fetch"].timeout_ms, None);
    }

    #[test]
    fn test_into_config_builds_topology() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let config: JobsConfig<String, String> = settings.into_config();

        assert!(config.validate().is_ok());
        assert_eq!(config.engine.threads_count, 4);
        assert_eq!(config.engine.prio_config.levels.len(), 3);

        let select = &config.types[&JobType::new("select")];
        assert_eq!(select.group, JobGroup::new("database"));
        assert_eq!(select.timeout, Some(Duration::from_millis(500)));

        let database = &config.groups[&JobGroup::new("database")];
        assert_eq!(database.delay_next_request, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.engine.threads_count, DEFAULT_ENGINE_THREADS);
        assert!(settings.groups.is_empty());

        let config: JobsConfig<(), ()> = settings.into_config();
        assert_eq!(config.engine.prio_config.levels.len(), 6);
    }

    #[test]
    fn test_bad_toml_is_a_config_error() {
        let err = Settings::from_toml("engine = \"nope\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
