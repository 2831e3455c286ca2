use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ServerError;

/// Default module entry point relative to the manifest directory.
pub const DEFAULT_ENTRY_POINT: &str = "dist/index.js";

/// Parsed `manifest.json` for a single module.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_multi_instance", rename = "multiInstanceSpawning")]
    pub multi_instance: bool,
    #[serde(default)]
    pub repo: Option<String>,

    /// Directory the manifest was found in. Not part of the file.
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_multi_instance() -> bool {
    true
}

impl Manifest {
    /// Absolute path to the module entry point.
    pub fn entry_path(&self) -> PathBuf {
        self.path
            .join(self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT))
    }
}

/// Outcome of dependency resolution: modules to load, in order, and modules
/// skipped because of unresolved or skipped dependencies.
#[derive(Debug, Clone, Default)]
pub struct LoadOrder {
    pub sorted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Discovers module manifests under a root directory and resolves their load
/// order.
///
/// Two directory levels are scanned: plain `<root>/<module>` entries and
/// namespaced `<root>/@ns/<module>` entries. A directory qualifies iff it
/// contains a `manifest.json` with a non-empty `name`.
pub struct ManifestRegistry {
    manifests: HashMap<String, Manifest>,
}

impl ManifestRegistry {
    /// Scan the modules root. Duplicate module names are a fatal boot error;
    /// unreadable or malformed manifests are logged and skipped.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut manifests = HashMap::new();

        if !root.exists() {
            warn!("Modules directory {} does not exist", root.display());
            return Ok(Self { manifests });
        }

        for dir in module_dirs(root)? {
            let manifest_path = dir.join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }

            let manifest = match read_manifest(&manifest_path, &dir) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Skipping {}: {e:#}", manifest_path.display());
                    continue;
                }
            };

            debug!(
                "Discovered module '{}' at {}",
                manifest.name,
                dir.display()
            );

            if let Some(previous) = manifests.insert(manifest.name.clone(), manifest) {
                return Err(ServerError::Boot(format!(
                    "duplicate module name '{}' (first seen at {})",
                    previous.name,
                    previous.path.display()
                ))
                .into());
            }
        }

        Ok(Self { manifests })
    }

    /// Build a registry directly from manifests. Used by tests and tooling.
    pub fn from_manifests(manifests: Vec<Manifest>) -> Self {
        Self {
            manifests: manifests.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Manifest> {
        self.manifests.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.manifests.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Depth-first topological sort over declared dependencies.
    ///
    /// A dependency cycle is a fatal boot error and aborts the whole load; a
    /// module with an unknown dependency is skipped, and skipping is
    /// transitive: dependents of a skipped module are skipped too.
    pub fn resolve_order(&self) -> Result<LoadOrder> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = LoadOrder::default();

        let mut names: Vec<&str> = self.manifests.keys().map(String::as_str).collect();
        names.sort_unstable();

        for name in names {
            self.visit(name, &mut marks, &mut order)?;
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut LoadOrder,
    ) -> Result<bool> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(true),
            Some(Mark::Skipped) => return Ok(false),
            Some(Mark::Visiting) => {
                return Err(ServerError::Boot(format!(
                    "circular module dependency involving '{name}'"
                ))
                .into());
            }
            None => {}
        }

        // The scan placed every name we can reach into the map; a miss here
        // means the registry was mutated mid-traversal.
        let manifest = self.manifests.get(name).ok_or_else(|| {
            ServerError::Boot(format!("manifest '{name}' vanished during dependency resolution"))
        })?;

        marks.insert(name, Mark::Visiting);

        let mut usable = true;
        for dep in &manifest.dependencies {
            if !self.manifests.contains_key(dep.as_str()) {
                warn!("Module '{name}' depends on unknown module '{dep}'; skipping");
                usable = false;
                continue;
            }
            if !self.visit(dep.as_str(), marks, order)? {
                warn!("Module '{name}' depends on skipped module '{dep}'; skipping");
                usable = false;
            }
        }

        if usable {
            marks.insert(name, Mark::Done);
            order.sorted.push(name.to_string());
        } else {
            marks.insert(name, Mark::Skipped);
            order.skipped.push(name.to_string());
        }

        Ok(usable)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
    Skipped,
}

/// Enumerate candidate module directories: one level of plain entries plus
/// one nested level under `@`-prefixed namespace directories.
fn module_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();

    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read modules directory {}", root.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        let is_namespace = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('@'))
            .unwrap_or(false);

        if is_namespace {
            for nested in std::fs::read_dir(&path)? {
                let nested = nested?.path();
                if nested.is_dir() {
                    dirs.push(nested);
                }
            }
        } else {
            dirs.push(path);
        }
    }

    Ok(dirs)
}

fn read_manifest(manifest_path: &Path, dir: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(manifest_path).context("unreadable manifest")?;
    let mut manifest: Manifest = serde_json::from_str(&raw).context("malformed manifest")?;

    if manifest.name.trim().is_empty() {
        return Err(anyhow::anyhow!("manifest has an empty name"));
    }

    manifest.path = dir.to_path_buf();
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, deps: &[&str]) -> Manifest {
        Manifest {
            name: name.to_string(),
            version: None,
            author: None,
            description: None,
            license: None,
            entry_point: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            multi_instance: true,
            repo: None,
            path: PathBuf::from("/tmp").join(name),
        }
    }

    #[test]
    fn sorts_dependencies_first() {
        let registry = ManifestRegistry::from_manifests(vec![
            manifest("app", &["core", "db"]),
            manifest("db", &["core"]),
            manifest("core", &[]),
        ]);

        let order = registry.resolve_order().unwrap();
        assert!(order.skipped.is_empty());

        let pos = |n: &str| order.sorted.iter().position(|s| s == n).unwrap();
        assert!(pos("core") < pos("db"));
        assert!(pos("db") < pos("app"));
        assert!(pos("core") < pos("app"));
    }

    #[test]
    fn cycle_is_fatal() {
        let registry = ManifestRegistry::from_manifests(vec![
            manifest("a", &["b"]),
            manifest("b", &["a"]),
        ]);

        assert!(registry.resolve_order().is_err());
    }

    #[test]
    fn unknown_dependency_skips_dependent_transitively() {
        let registry = ManifestRegistry::from_manifests(vec![
            manifest("leaf", &["mid"]),
            manifest("mid", &["ghost"]),
            manifest("solo", &[]),
        ]);

        let order = registry.resolve_order().unwrap();
        assert_eq!(order.sorted, vec!["solo".to_string()]);

        let mut skipped = order.skipped.clone();
        skipped.sort();
        assert_eq!(skipped, vec!["leaf".to_string(), "mid".to_string()]);
    }

    #[test]
    fn sorted_and_skipped_are_disjoint() {
        let registry = ManifestRegistry::from_manifests(vec![
            manifest("a", &[]),
            manifest("b", &["missing"]),
            manifest("c", &["a"]),
        ]);

        let order = registry.resolve_order().unwrap();
        for name in &order.sorted {
            assert!(!order.skipped.contains(name));
        }
    }

    #[test]
    fn scan_handles_namespaced_layout() {
        let root = tempfile::tempdir().unwrap();

        let plain = root.path().join("alpha");
        std::fs::create_dir_all(&plain).unwrap();
        std::fs::write(
            plain.join("manifest.json"),
            r#"{"name": "alpha"}"#,
        )
        .unwrap();

        let namespaced = root.path().join("@acme").join("beta");
        std::fs::create_dir_all(&namespaced).unwrap();
        std::fs::write(
            namespaced.join("manifest.json"),
            r#"{"name": "@acme/beta", "dependencies": ["alpha"]}"#,
        )
        .unwrap();

        // A directory without a manifest does not qualify.
        std::fs::create_dir_all(root.path().join("not-a-module")).unwrap();

        let registry = ManifestRegistry::scan(root.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("@acme/beta").is_some());

        let order = registry.resolve_order().unwrap();
        assert_eq!(order.sorted, vec!["alpha".to_string(), "@acme/beta".to_string()]);
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        for dir in ["one", "two"] {
            let path = root.path().join(dir);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("manifest.json"), r#"{"name": "dup"}"#).unwrap();
        }

        assert!(ManifestRegistry::scan(root.path()).is_err());
    }

    #[test]
    fn entry_path_uses_default() {
        let m = manifest("x", &[]);
        assert!(m.entry_path().ends_with("dist/index.js"));
    }
}
