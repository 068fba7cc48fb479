//! Client and server options for the language session
//!
//! Mirrors the option bag an editor language client is constructed with:
//! which documents the server handles, which settings namespace and files
//! are synchronized, and how the output channel behaves.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::lsp::error::LspError;

// ============================================================================
// Document selector
// ============================================================================

/// One entry of a document selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl DocumentFilter {
    pub fn language(language_id: impl Into<String>) -> Self {
        Self {
            language: Some(language_id.into()),
            scheme: None,
        }
    }

    pub fn matches(&self, language_id: &str, scheme: &str) -> bool {
        let language_ok = self.language.as_deref().is_none_or(|l| l == language_id);
        let scheme_ok = self.scheme.as_deref().is_none_or(|s| s == scheme);
        language_ok && scheme_ok
    }
}

/// The documents the language server is responsible for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentSelector(pub Vec<DocumentFilter>);

impl DocumentSelector {
    pub fn for_language(language_id: impl Into<String>) -> Self {
        Self(vec![DocumentFilter::language(language_id)])
    }

    /// True when any filter accepts the document
    pub fn matches(&self, language_id: &str, scheme: &str) -> bool {
        self.0.iter().any(|filter| filter.matches(language_id, scheme))
    }
}

// ============================================================================
// Synchronization
// ============================================================================

/// Compiled set of file-watch globs
#[derive(Debug, Clone)]
pub struct FileEventFilter {
    patterns: Vec<String>,
    set: GlobSet,
}

impl FileEventFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, LspError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|e| LspError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| LspError::InvalidGlob {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self { patterns, set })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Match `path`, relative to `root` when it lies inside it
    pub fn matches(&self, path: &Path, root: Option<&Path>) -> bool {
        let relative = root
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        self.set.is_match(relative)
    }
}

/// Which settings and files are kept in sync with the server
#[derive(Debug, Clone)]
pub struct SynchronizeOptions {
    /// Settings namespace pushed via `workspace/didChangeConfiguration`
    pub configuration_section: String,
    pub file_events: FileEventFilter,
}

// ============================================================================
// Output channel policy
// ============================================================================

/// When the output channel is brought to the front on server output
///
/// Numeric values follow the host platform, where `Never` is 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum RevealOutputChannelOn {
    Info = 1,
    Warn = 2,
    Error = 3,
    Never = 4,
}

impl RevealOutputChannelOn {
    /// Whether a line of `severity` should reveal the channel
    pub fn reveals(self, severity: RevealOutputChannelOn) -> bool {
        self != RevealOutputChannelOn::Never && severity >= self
    }
}

// ============================================================================
// Option bags
// ============================================================================

/// Client-side options of the language session
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub document_selector: DocumentSelector,
    pub synchronize: SynchronizeOptions,
    pub output_channel_name: String,
    pub reveal_output_channel_on: RevealOutputChannelOn,
}

impl ClientOptions {
    /// Options for a single-language client with `glob` file watching
    pub fn for_language(
        language_id: &str,
        glob: &str,
        output_channel_name: &str,
    ) -> Result<Self, LspError> {
        Ok(Self {
            document_selector: DocumentSelector::for_language(language_id),
            synchronize: SynchronizeOptions {
                configuration_section: language_id.to_string(),
                file_events: FileEventFilter::new([glob])?,
            },
            output_channel_name: output_channel_name.to_string(),
            reveal_output_channel_on: RevealOutputChannelOn::Never,
        })
    }
}

/// How the server process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ServerOptions {
    /// Argument-less invocation of `command` in `cwd`
    pub fn new(command: impl Into<PathBuf>, cwd: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_selector_matches_language_only() {
        let selector = DocumentSelector::for_language("java");
        assert!(selector.matches("java", "file"));
        assert!(selector.matches("java", "untitled"));
        assert!(!selector.matches("kotlin", "file"));
        assert!(!DocumentSelector::default().matches("java", "file"));
    }

    #[test]
    fn test_document_selector_serializes_as_list() {
        let selector = DocumentSelector::for_language("java");
        assert_eq!(
            serde_json::to_value(&selector).unwrap(),
            serde_json::json!([{"language": "java"}])
        );
    }

    #[test]
    fn test_file_event_filter_matches_relative_to_root() {
        let filter = FileEventFilter::new(["**/*.java"]).unwrap();
        let root = Path::new("/proj");

        assert!(filter.matches(Path::new("/proj/src/a/Main.java"), Some(root)));
        assert!(filter.matches(Path::new("/proj/Main.java"), Some(root)));
        assert!(!filter.matches(Path::new("/proj/build.gradle"), Some(root)));
        assert!(filter.matches(Path::new("/elsewhere/Other.java"), Some(root)));
        assert_eq!(filter.patterns(), ["**/*.java"]);
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = FileEventFilter::new(["src/[a"]).unwrap_err();
        assert!(matches!(err, LspError::InvalidGlob { ref pattern, .. } if pattern == "src/[a"));
    }

    #[test]
    fn test_reveal_policy() {
        use RevealOutputChannelOn::*;
        for severity in [Info, Warn, Error] {
            assert!(!Never.reveals(severity));
        }
        assert!(Warn.reveals(Error));
        assert!(Warn.reveals(Warn));
        assert!(!Warn.reveals(Info));
        assert!(Info.reveals(Info));
        assert_eq!(Never as u8, 4);
    }

    #[test]
    fn test_java_client_options() {
        let options = ClientOptions::for_language("java", "**/*.java", "Java").unwrap();
        assert_eq!(options.synchronize.configuration_section, "java");
        assert_eq!(options.output_channel_name, "Java");
        assert_eq!(options.reveal_output_channel_on, RevealOutputChannelOn::Never);
        assert!(options.document_selector.matches("java", "file"));
    }

    #[test]
    fn test_server_options_are_argument_less() {
        let options = ServerOptions::new("/ext/bin/server", Some(PathBuf::from("/proj")));
        assert!(options.args.is_empty());
        assert_eq!(options.cwd.as_deref(), Some(Path::new("/proj")));
    }
}
