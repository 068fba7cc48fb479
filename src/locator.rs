//! Process Locator
//!
//! Computes where the bundled language server lives inside the extension's
//! installation directory. Pure path arithmetic: nothing here touches the
//! filesystem, so a missing executable only shows up when it is spawned.

use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_SUBDIR: &str = "nb-java-lsp-server";
pub const DEFAULT_SERVER_EXECUTABLE: &str = "nb-java-lsp-server";

/// Layout of the bundled server: `<subdir>/bin/<executable>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBundle {
    pub subdir: String,
    pub executable: String,
}

impl Default for ServerBundle {
    fn default() -> Self {
        Self {
            subdir: DEFAULT_SERVER_SUBDIR.to_string(),
            executable: DEFAULT_SERVER_EXECUTABLE.to_string(),
        }
    }
}

/// Resolved path of the server executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLocation(PathBuf);

impl ServerLocation {
    pub fn resolve(install_dir: &Path, bundle: &ServerBundle) -> Self {
        Self(
            install_dir
                .join(&bundle.subdir)
                .join("bin")
                .join(&bundle.executable),
        )
    }

    /// Use an explicitly configured executable instead of the bundle
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for ServerLocation {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// `<install_dir>/nb-java-lsp-server/bin/nb-java-lsp-server`
pub fn server_path(install_dir: &Path) -> PathBuf {
    server_path_with(install_dir, &ServerBundle::default())
}

pub fn server_path_with(install_dir: &Path, bundle: &ServerBundle) -> PathBuf {
    ServerLocation::resolve(install_dir, bundle).into_path_buf()
}
