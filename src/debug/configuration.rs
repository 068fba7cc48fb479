//! Launch configurations and the Java configuration resolver

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Class path handed to the adapter; it resolves the real one itself
pub const CLASS_PATH_PLACEHOLDER: &str = "any";

pub const PROGRAM: &str = "program";
pub const MAIN_CLASS: &str = "mainClass";
pub const CLASS_PATHS: &str = "classPaths";

/// User-authored key/value description of a debug session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchConfiguration(Map<String, Value>);

impl LaunchConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The debugger type (`type`)
    pub fn debug_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// `launch` or `attach`
    pub fn request(&self) -> Option<&str> {
        self.get_str("request")
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn program(&self) -> Option<&Value> {
        self.0.get(PROGRAM)
    }

    pub fn main_class(&self) -> Option<&Value> {
        self.0.get(MAIN_CLASS)
    }

    pub fn class_paths(&self) -> Option<&Value> {
        self.0.get(CLASS_PATHS)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for LaunchConfiguration {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Workspace folder a debug session is started in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFolder {
    pub path: PathBuf,
    pub name: String,
    pub index: usize,
}

impl WorkspaceFolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            index: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reshapes a launch configuration before a debug session starts
///
/// Returning `None` aborts the session start.
pub trait DebugConfigurationProvider: Send + Sync {
    fn resolve_debug_configuration(
        &self,
        folder: Option<&WorkspaceFolder>,
        config: LaunchConfiguration,
        token: Option<&CancellationToken>,
    ) -> Option<LaunchConfiguration>;
}

/// Maps `program` onto the Java adapter's `mainClass` and pins `classPaths`
#[derive(Debug, Clone, Copy, Default)]
pub struct JavaConfigurationProvider;

impl DebugConfigurationProvider for JavaConfigurationProvider {
    fn resolve_debug_configuration(
        &self,
        _folder: Option<&WorkspaceFolder>,
        mut config: LaunchConfiguration,
        _token: Option<&CancellationToken>,
    ) -> Option<LaunchConfiguration> {
        match config.program().cloned() {
            Some(program) => {
                config.insert(MAIN_CLASS, program);
            }
            None => {
                // No validation: the adapter reports the missing main class
                warn!("Launch configuration has no '{}'; mainClass left unset", PROGRAM);
                config.remove(MAIN_CLASS);
            }
        }
        config.insert(CLASS_PATHS, vec![Value::from(CLASS_PATH_PLACEHOLDER)]);

        debug!("Resolved launch configuration: {:?}", config);
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(value: Value) -> Value {
        let config: LaunchConfiguration = serde_json::from_value(value).unwrap();
        JavaConfigurationProvider
            .resolve_debug_configuration(None, config, None)
            .unwrap()
            .into_value()
    }

    #[test]
    fn test_program_becomes_main_class() {
        assert_eq!(
            resolve(json!({"program": "/proj/Main"})),
            json!({"program": "/proj/Main", "mainClass": "/proj/Main", "classPaths": ["any"]})
        );
    }

    #[test]
    fn test_unrelated_fields_pass_through() {
        let resolved = resolve(json!({
            "type": "java",
            "name": "Launch Main",
            "request": "launch",
            "program": "com.example.Main",
            "args": ["--verbose"],
            "vmArgs": "-Xmx1g",
            "classPaths": ["/stale"],
        }));

        assert_eq!(
            resolved,
            json!({
                "type": "java",
                "name": "Launch Main",
                "request": "launch",
                "program": "com.example.Main",
                "mainClass": "com.example.Main",
                "args": ["--verbose"],
                "vmArgs": "-Xmx1g",
                "classPaths": ["any"],
            })
        );
    }

    #[test]
    fn test_extra_fields_do_not_change_the_mapping() {
        let plain = resolve(json!({"program": "/p"}));
        let extended = resolve(json!({"program": "/p", "env": {"A": "1"}, "cwd": "/w"}));

        for key in [PROGRAM, MAIN_CLASS, CLASS_PATHS] {
            assert_eq!(plain[key], extended[key], "{key}");
        }
    }

    #[test]
    fn test_missing_program_does_not_fail() {
        let resolved = resolve(json!({"type": "java", "mainClass": "Stale"}));
        assert!(resolved.get(MAIN_CLASS).is_none());
        assert_eq!(resolved[CLASS_PATHS], json!(["any"]));
        assert_eq!(resolved["type"], "java");
    }

    #[test]
    fn test_folder_and_token_are_ignored() {
        let folder = WorkspaceFolder::new("/proj");
        let token = CancellationToken::new();
        token.cancel();

        let config: LaunchConfiguration =
            serde_json::from_value(json!({"program": "/proj/Main"})).unwrap();
        let resolved = JavaConfigurationProvider
            .resolve_debug_configuration(Some(&folder), config, Some(&token))
            .unwrap();
        assert_eq!(resolved.main_class(), Some(&json!("/proj/Main")));
        assert_eq!(folder.name, "proj");
    }

    #[test]
    fn test_accessors() {
        let config: LaunchConfiguration = serde_json::from_value(json!({
            "type": "java", "request": "attach", "name": "Attach", "port": 5005
        }))
        .unwrap();
        assert_eq!(config.debug_type(), Some("java"));
        assert_eq!(config.request(), Some("attach"));
        assert_eq!(config.name(), Some("Attach"));
        assert_eq!(config.get("port"), Some(&json!(5005)));
        assert!(config.program().is_none());
        assert!(config.class_paths().is_none());
    }
}
