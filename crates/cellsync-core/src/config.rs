//! Notebook, session and sink configuration.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

const CLASS_PATH: &str = "--class-path";
const MODULE_PATH: &str = "--module-path";
const ADD_MODULES: &str = "--add-modules";
const ENABLE_PREVIEW: &str = "--enable-preview";
const SOURCE_FLAG: &str = "--source";

const DEFAULT_IMPORTS: [&str; 3] = ["java.util", "java.io", "java.math"];

/// User notebook settings, as returned by the editor's configuration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotebookConfig {
    pub class_path: Option<String>,
    pub module_path: Option<String>,
    pub add_modules: Option<String>,
    pub enable_preview: bool,
    pub implicit_imports: Option<Vec<String>>,
    /// Value passed to `--source` when preview features are enabled.
    pub language_version: Option<String>,
}

/// Options resolved from the build project a notebook belongs to.
///
/// Both lists are flat `flag, value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectOptions {
    pub compiler_options: Vec<String>,
    pub launch_options: Vec<String>,
}

/// Option lists handed to the interpreter factory. Opaque to everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub compiler_options: Vec<String>,
    pub runtime_options: Vec<String>,
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn push_option(options: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        options.push(flag.to_string());
        options.push(value.to_string());
    }
}

fn pairs(flat: &[String]) -> HashMap<&str, &str> {
    flat.chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect()
}

impl NotebookConfig {
    fn user_paths(&self) -> [(&'static str, Option<&str>); 3] {
        [
            (CLASS_PATH, self.class_path.as_deref()),
            (MODULE_PATH, self.module_path.as_deref()),
            (ADD_MODULES, self.add_modules.as_deref()),
        ]
    }

    /// Fill path/module flags the user left blank from project options.
    fn push_project_fallbacks(&self, options: &mut Vec<String>, project: &[String]) {
        let project = pairs(project);
        for (flag, value) in self.user_paths() {
            if is_blank(value) {
                push_option(options, flag, project.get(flag).copied());
            }
        }
    }

    /// Build the compiler and runtime option lists for a new session.
    #[must_use]
    pub fn session_config(&self, project: Option<&ProjectOptions>) -> SessionConfig {
        let mut compiler_options = Vec::new();
        let mut runtime_options = Vec::new();

        for (flag, value) in self.user_paths() {
            push_option(&mut compiler_options, flag, value);
            push_option(&mut runtime_options, flag, value);
        }

        if self.enable_preview {
            compiler_options.push(ENABLE_PREVIEW.to_string());
            if let Some(version) = self.language_version.as_deref().filter(|v| !v.is_empty()) {
                compiler_options.push(SOURCE_FLAG.to_string());
                compiler_options.push(version.to_string());
            }
            runtime_options.push(ENABLE_PREVIEW.to_string());
        }

        if let Some(project) = project {
            self.push_project_fallbacks(&mut compiler_options, &project.compiler_options);
            self.push_project_fallbacks(&mut runtime_options, &project.launch_options);
        }

        SessionConfig {
            compiler_options,
            runtime_options,
        }
    }

    /// Import statements evaluated silently once a session has started.
    #[must_use]
    pub fn startup_snippets(&self) -> Vec<String> {
        match self.implicit_imports.as_deref() {
            Some(packages) if !packages.is_empty() => packages
                .iter()
                .map(|pkg| format!("import {pkg}"))
                .collect(),
            _ => DEFAULT_IMPORTS
                .iter()
                .map(|pkg| format!("import {pkg}.*"))
                .collect(),
        }
    }
}

/// Output buffering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub capacity: usize,
    pub flush_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Everything the session registry needs to start a notebook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    pub notebook: NotebookConfig,
    /// Options of the build project the notebooks belong to, if resolved.
    pub project: Option<ProjectOptions>,
    pub sink: SinkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_camel_case() {
        let config: NotebookConfig = serde_json::from_str(
            r#"{"classPath":"/lib/a.jar","enablePreview":true,"implicitImports":["java.time.*"],"languageVersion":"21"}"#,
        )
        .unwrap();
        assert_eq!(config.class_path.as_deref(), Some("/lib/a.jar"));
        assert!(config.enable_preview);
        assert!(config.module_path.is_none());

        let empty: NotebookConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, NotebookConfig::default());
    }

    #[test]
    fn test_session_config_from_user_settings() {
        let config = NotebookConfig {
            class_path: Some("/lib/a.jar".into()),
            module_path: Some("  ".into()),
            add_modules: Some("java.sql".into()),
            enable_preview: true,
            language_version: Some("21".into()),
            ..Default::default()
        };
        let session = config.session_config(None);
        assert_eq!(
            session.compiler_options,
            [
                "--class-path",
                "/lib/a.jar",
                "--add-modules",
                "java.sql",
                "--enable-preview",
                "--source",
                "21"
            ]
        );
        assert_eq!(
            session.runtime_options,
            ["--class-path", "/lib/a.jar", "--add-modules", "java.sql", "--enable-preview"]
        );
    }

    #[test]
    fn test_project_options_fill_blank_settings_only() {
        let config = NotebookConfig {
            class_path: Some("/user.jar".into()),
            ..Default::default()
        };
        let project = ProjectOptions {
            compiler_options: vec![
                "--class-path".into(),
                "/project.jar".into(),
                "--module-path".into(),
                "/mods".into(),
            ],
            launch_options: vec!["--add-modules".into(), "ALL-SYSTEM".into(), "--dangling".into()],
        };
        let session = config.session_config(Some(&project));
        assert_eq!(
            session.compiler_options,
            ["--class-path", "/user.jar", "--module-path", "/mods"]
        );
        assert_eq!(
            session.runtime_options,
            ["--class-path", "/user.jar", "--add-modules", "ALL-SYSTEM"]
        );
    }

    #[test]
    fn test_startup_snippets() {
        assert_eq!(
            NotebookConfig::default().startup_snippets(),
            ["import java.util.*", "import java.io.*", "import java.math.*"]
        );
        let config = NotebookConfig {
            implicit_imports: Some(vec!["java.time.*".into()]),
            ..Default::default()
        };
        assert_eq!(config.startup_snippets(), ["import java.time.*"]);
    }

    #[test]
    fn test_sink_defaults() {
        let sink = SinkConfig::default();
        assert_eq!(sink.capacity, 1024);
        assert_eq!(sink.flush_interval, Duration::from_millis(100));
    }
}
