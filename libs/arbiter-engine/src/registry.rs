// Language registry: language id -> execution profile, loaded once at startup

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Resource ceilings applied to every sandbox created for a language.
///
/// Missing fields in `languages.json` fall back to these defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Default wall-clock budget for compile + run
    pub wall_clock_ms: u64,
    /// RLIMIT_CPU, in seconds
    pub cpu_time_secs: u64,
    pub memory_mb: u64,
    pub memory_swap_mb: u64,
    /// Fraction of CPUs (1.0 = one full core)
    pub cpu_limit: f64,
    pub pids_limit: i64,
    /// Size of the writable scratch space, and RLIMIT_FSIZE
    pub disk_mb: u64,
    /// Per-stream capture ceiling for stdout and stderr
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_ms: 5000,
            cpu_time_secs: 10,
            memory_mb: 256,
            memory_swap_mb: 0,
            cpu_limit: 1.0,
            pids_limit: 64,
            disk_mb: 64,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    /// Docker's memory_swap is memory + swap.
    pub fn memory_swap_bytes(&self) -> i64 {
        ((self.memory_mb + self.memory_swap_mb) as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    pub fn disk_bytes(&self) -> i64 {
        (self.disk_mb as i64) * 1024 * 1024
    }
}

/// How to build and run one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    pub image: String,
    /// Template with `{source}`, `{workspace}` and `{submission}` placeholders
    #[serde(default)]
    pub compile_command: Option<String>,
    pub run_command: String,
    pub file_extension: String,
    #[serde(default = "default_source_stem")]
    pub source_stem: String,
    #[serde(default)]
    pub limits: ResourceLimits,
}

fn default_source_stem() -> String {
    "main".to_string()
}

impl LanguageProfile {
    pub fn source_file_name(&self) -> String {
        format!("{}.{}", self.source_stem, self.file_extension)
    }

    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("language id must not be empty".to_string());
        }
        if self.image.trim().is_empty() {
            return Err(format!("{}: image must not be empty", self.id));
        }
        if self.run_command.trim().is_empty() {
            return Err(format!("{}: run_command must not be empty", self.id));
        }
        if matches!(&self.compile_command, Some(cmd) if cmd.trim().is_empty()) {
            return Err(format!("{}: compile_command must be omitted or non-empty", self.id));
        }
        if self.file_extension.is_empty() || self.file_extension.starts_with('.') {
            return Err(format!(
                "{}: file_extension must be non-empty and have no leading dot",
                self.id
            ));
        }
        if self.source_stem.is_empty() || self.source_stem.contains('/') {
            return Err(format!("{}: source_stem must be a plain file name", self.id));
        }
        let limits = &self.limits;
        if limits.wall_clock_ms == 0 || limits.memory_mb == 0 || limits.cpu_time_secs == 0 {
            return Err(format!("{}: time and memory limits must be positive", self.id));
        }
        if limits.max_output_bytes == 0 || limits.disk_mb == 0 || limits.pids_limit <= 0 {
            return Err(format!("{}: output, disk and pids limits must be positive", self.id));
        }
        if limits.cpu_limit.is_nan() || limits.cpu_limit <= 0.0 {
            return Err(format!("{}: cpu_limit must be positive", self.id));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageProfile>,
}

/// Read-only after construction.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, LanguageProfile>,
}

impl LanguageRegistry {
    /// Load profiles from a `languages.json` file
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let registry_error = |reason: String| EngineError::Registry {
            path: path.to_path_buf(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| registry_error(e.to_string()))?;
        let parsed: LanguagesJson =
            serde_json::from_str(&content).map_err(|e| registry_error(e.to_string()))?;

        Self::from_profiles(parsed.languages).map_err(|e| match e {
            EngineError::Registry { reason, .. } => registry_error(reason),
            other => other,
        })
    }

    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self, EngineError> {
        let registry_error = |reason: String| EngineError::Registry {
            path: Default::default(),
            reason,
        };

        if profiles.is_empty() {
            return Err(registry_error("no languages configured".to_string()));
        }

        let mut map = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate().map_err(registry_error)?;
            if map.contains_key(&profile.id) {
                return Err(registry_error(format!("duplicate language id: {}", profile.id)));
            }
            map.insert(profile.id.clone(), profile);
        }

        Ok(Self { profiles: map })
    }

    /// Look up the profile for a language id
    pub fn resolve(&self, language_id: &str) -> Result<&LanguageProfile, EngineError> {
        self.profiles
            .get(language_id)
            .ok_or_else(|| EngineError::UnknownLanguage(language_id.to_string()))
    }

    /// Registered language ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SHIPPED: &str = include_str!("../../../config/languages.json");

    fn profile(id: &str) -> LanguageProfile {
        LanguageProfile {
            id: id.to_string(),
            image: "python:3.12-slim".to_string(),
            compile_command: None,
            run_command: "python3 {source}".to_string(),
            file_extension: "py".to_string(),
            source_stem: "main".to_string(),
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let registry = LanguageRegistry::from_profiles(vec![profile("python3.12")]).unwrap();
        assert_eq!(registry.resolve("python3.12").unwrap().id, "python3.12");
        match registry.resolve("cobol") {
            Err(EngineError::UnknownLanguage(id)) => assert_eq!(id, "cobol"),
            other => panic!("expected UnknownLanguage, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = LanguageRegistry::from_profiles(vec![profile("py"), profile("py")]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(LanguageRegistry::from_profiles(Vec::new()).is_err());
    }

    #[test]
    fn test_rejects_dotted_extension() {
        let mut bad = profile("py");
        bad.file_extension = ".py".to_string();
        assert!(LanguageRegistry::from_profiles(vec![bad]).is_err());
    }

    #[test]
    fn test_rejects_zero_output_cap() {
        let mut bad = profile("py");
        bad.limits.max_output_bytes = 0;
        assert!(LanguageRegistry::from_profiles(vec![bad]).is_err());
    }

    #[test]
    fn test_partial_limits_use_defaults() {
        let json = r#"{"languages":[{
            "id": "python3.12",
            "image": "python:3.12-slim",
            "run_command": "python3 {source}",
            "file_extension": "py",
            "limits": { "memory_mb": 128 }
        }]}"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let registry = LanguageRegistry::load(file.path()).unwrap();
        let profile = registry.resolve("python3.12").unwrap();
        assert_eq!(profile.limits.memory_mb, 128);
        assert_eq!(profile.limits.wall_clock_ms, ResourceLimits::default().wall_clock_ms);
        assert_eq!(profile.source_file_name(), "main.py");
        assert!(!profile.needs_compile());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        match LanguageRegistry::load(file.path()) {
            Err(EngineError::Registry { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected Registry error, got {:?}", other),
        }
    }

    #[test]
    fn test_shipped_config_parses() {
        let parsed: LanguagesJson = serde_json::from_str(SHIPPED).unwrap();
        let registry = LanguageRegistry::from_profiles(parsed.languages).unwrap();
        assert!(registry.resolve("python3.12").is_ok());
        let cpp = registry.resolve("cpp11").unwrap();
        assert!(cpp.needs_compile());
        assert_eq!(cpp.source_file_name(), "main.cpp");
        let ids = registry.list();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.len(), registry.len());
    }

    #[test]
    fn test_limit_conversions() {
        let limits = ResourceLimits {
            memory_mb: 256,
            memory_swap_mb: 0,
            cpu_limit: 0.5,
            ..Default::default()
        };
        assert_eq!(limits.memory_bytes(), 256 * 1024 * 1024);
        assert_eq!(limits.memory_swap_bytes(), limits.memory_bytes());
        assert_eq!(limits.nano_cpus(), 500_000_000);
    }
}
