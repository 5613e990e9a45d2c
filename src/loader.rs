//! Sandboxed loader for the modules a script imports at bundle time.
//! Blocks remote specifiers and filesystem escape, and only hands out
//! scripts, JSON and text assets.

use anyhow::{anyhow, Error};
use std::path::{Path, PathBuf};

/// Extensions tried, in order, when a specifier names no existing file.
const RESOLVE_EXTENSIONS: &[&str] = &["js", "mjs", "json", "txt"];

/// How a loaded file becomes a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Script,
    Json,
    Text,
}

impl AssetKind {
    fn for_path(path: &Path) -> Result<Self, Error> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js") | Some("mjs") | Some("cjs") => Ok(Self::Script),
            Some("json") => Ok(Self::Json),
            Some("txt") => Ok(Self::Text),
            Some(other) => Err(anyhow!("No loader is configured for \".{}\" files", other)),
            None => Err(anyhow!(
                "No loader is configured for \"{}\"",
                path.display()
            )),
        }
    }
}

/// A local module read from disk.
#[derive(Debug)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub source: String,
}

/// A loader that restricts all local imports to a single directory.
///
/// Security guarantees:
/// - No network access (http/https/data/blob specifiers rejected)
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - Only script, JSON and text files loadable
pub struct SandboxedLoader {
    allowed_dir: PathBuf,
}

impl SandboxedLoader {
    /// Create a loader that only allows loading from `allowed_dir`.
    pub fn new(allowed_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let canonical = allowed_dir
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("Failed to canonicalize resolve dir: {}", e))?;

        if !canonical.is_dir() {
            return Err(anyhow!("resolve dir must be a directory"));
        }

        Ok(Self {
            allowed_dir: canonical,
        })
    }

    pub fn allowed_dir(&self) -> &Path {
        &self.allowed_dir
    }

    /// Whether `specifier` names a local module rather than a host module.
    pub fn is_local(specifier: &str) -> bool {
        specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
    }

    fn is_remote(specifier: &str) -> bool {
        ["http://", "https://", "data:", "blob:", "file://"]
            .iter()
            .any(|scheme| specifier.starts_with(scheme))
    }

    /// Check if a path is within the allowed directory.
    /// Uses canonicalization to resolve symlinks and prevent traversal.
    fn is_path_allowed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.allowed_dir),
            Err(_) => false,
        }
    }

    fn candidates(base: &Path) -> Vec<PathBuf> {
        let mut candidates = vec![base.to_path_buf()];
        for ext in RESOLVE_EXTENSIONS {
            let mut with_ext = base.as_os_str().to_owned();
            with_ext.push(".");
            with_ext.push(ext);
            candidates.push(PathBuf::from(with_ext));
        }
        candidates.push(base.join("index.js"));
        candidates
    }

    /// Resolve a local specifier imported from a module living in `referrer_dir`.
    pub fn resolve(&self, specifier: &str, referrer_dir: &Path) -> Result<PathBuf, Error> {
        if Self::is_remote(specifier) {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }
        if !Self::is_local(specifier) {
            return Err(anyhow!("Could not resolve \"{}\"", specifier));
        }

        let base = if specifier.starts_with('/') {
            PathBuf::from(specifier)
        } else {
            referrer_dir.join(specifier)
        };

        let found = Self::candidates(&base)
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| anyhow!("Could not resolve \"{}\"", specifier))?;

        if !self.is_path_allowed(&found) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the allowed directory",
                found.display()
            ));
        }

        found
            .canonicalize()
            .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))
    }

    /// Read a resolved module. The path is re-checked against the sandbox.
    pub fn load(&self, path: &Path) -> Result<LoadedModule, Error> {
        if !self.is_path_allowed(path) {
            return Err(anyhow!("Access denied: {}", path.display()));
        }

        let kind = AssetKind::for_path(path)?;

        let source = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;

        Ok(LoadedModule {
            path: path.to_path_buf(),
            kind,
            source,
        })
    }

    /// Path shown in diagnostics: relative to the allowed directory.
    pub fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.allowed_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_blocks_remote_urls() {
        let dir = tempdir().unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let result = loader.resolve("https://evil.com/payload.js", dir.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Remote imports are forbidden"));
    }

    #[test]
    fn test_blocks_path_traversal() {
        let outer = tempdir().unwrap();
        let inner = outer.path().join("scripts");
        fs::create_dir(&inner).unwrap();
        fs::write(outer.path().join("secret.txt"), "hunter2").unwrap();
        let loader = SandboxedLoader::new(&inner).unwrap();

        let result = loader.resolve("../secret.txt", &inner);
        assert!(result.unwrap_err().to_string().contains("outside the allowed directory"));
    }

    #[test]
    fn test_resolves_with_extension_inference() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("util.js"), "export const a = 1;").unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("index.js"), "export default 1;").unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let util = loader.resolve("./util", dir.path()).unwrap();
        assert_eq!(util.file_name().unwrap(), "util.js");

        let lib = loader.resolve("./lib", dir.path()).unwrap();
        assert!(lib.ends_with("lib/index.js"));
        assert_eq!(loader.display_name(&lib), format!("lib{}index.js", std::path::MAIN_SEPARATOR));
    }

    #[test]
    fn test_bare_specifier_is_unresolved() {
        let dir = tempdir().unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let err = loader.resolve("lodash", dir.path()).unwrap_err();
        assert_eq!(err.to_string(), "Could not resolve \"lodash\"");
    }

    #[test]
    fn test_load_picks_asset_kind() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.json"), "{\"a\": 1}").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("style.css"), "a {}").unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let json = loader.resolve("./data.json", dir.path()).unwrap();
        assert_eq!(loader.load(&json).unwrap().kind, AssetKind::Json);

        let text = loader.resolve("./notes", dir.path()).unwrap();
        let text = loader.load(&text).unwrap();
        assert_eq!(text.kind, AssetKind::Text);
        assert_eq!(text.source, "hello");

        let css = loader.resolve("./style.css", dir.path()).unwrap();
        let err = loader.load(&css).unwrap_err();
        assert!(err.to_string().contains("No loader is configured for \".css\" files"));
    }
}
