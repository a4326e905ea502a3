//! Installed plugins and their activation state.
//!
//! The pipeline only needs a read view of installed plugins plus the ability
//! to activate and deactivate one; [`PluginHost`] is that seam.
//! [`DirectoryHost`] implements it over a plugins directory laid out the
//! WordPress way: `plugins/<folder>/<main>.php` or `plugins/<single>.php`,
//! each main file carrying a header block such as
//!
//! ```text
//! /*
//!  * Plugin Name: Acme SEO
//!  * Version: 1.2.0
//!  * Text Domain: acme-seo
//!  */
//! ```

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{UpdaterError, UpdaterResult};

/// How much of a PHP file is scanned for header fields.
const HEADER_SCAN_BYTES: u64 = 8 * 1024;

/// A plugin present in the plugins directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPluginRecord {
    /// Main file path relative to the plugins directory, `/`-separated.
    pub path: String,
    /// Display name from the header.
    pub name: String,
    /// Version from the header (empty if absent).
    pub version: String,
    /// Text domain from the header (empty if absent).
    pub text_domain: String,
    /// Whether the plugin is active.
    pub active: bool,
}

impl InstalledPluginRecord {
    /// Folder holding the main file, or `None` for single-file plugins.
    pub fn folder(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(folder, _)| folder)
    }
}

/// Host environment the pipeline installs into.
pub trait PluginHost: Send + Sync {
    /// Root of the live plugin installation.
    fn plugins_dir(&self) -> &Path;

    /// Every installed plugin, sorted by path.
    fn installed_plugins(&self) -> UpdaterResult<Vec<InstalledPluginRecord>>;

    /// Whether the plugin at `plugin_file` is active.
    fn is_active(&self, plugin_file: &str) -> bool;

    /// Activate a plugin.
    fn activate(&self, plugin_file: &str) -> UpdaterResult<()>;

    /// Deactivate a plugin.
    fn deactivate(&self, plugin_file: &str) -> UpdaterResult<()>;
}

/// Persisted activation state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ActivationState {
    active: BTreeSet<String>,
}

/// [`PluginHost`] over a directory on disk.
pub struct DirectoryHost {
    plugins_dir: PathBuf,
    state_path: PathBuf,
    state: Mutex<ActivationState>,
}

impl DirectoryHost {
    /// Create a host for `plugins_dir`, persisting activation state in `state_dir`.
    pub fn new(plugins_dir: PathBuf, state_dir: &Path) -> UpdaterResult<Self> {
        std::fs::create_dir_all(&plugins_dir).map_err(|e| {
            UpdaterError::fs(format!("Failed to create {}", plugins_dir.display()), e)
        })?;
        std::fs::create_dir_all(state_dir)
            .map_err(|e| UpdaterError::fs(format!("Failed to create {}", state_dir.display()), e))?;

        let state_path = state_dir.join("active_plugins.json");
        let state = if state_path.exists() {
            let content = std::fs::read_to_string(&state_path).map_err(|e| {
                UpdaterError::fs(format!("Failed to read {}", state_path.display()), e)
            })?;
            serde_json::from_str(&content).map_err(|e| UpdaterError::Json(e.to_string()))?
        } else {
            ActivationState::default()
        };

        Ok(Self { plugins_dir, state_path, state: Mutex::new(state) })
    }

    fn save_state(&self, state: &ActivationState) -> UpdaterResult<()> {
        let content =
            serde_json::to_string_pretty(state).map_err(|e| UpdaterError::Json(e.to_string()))?;
        std::fs::write(&self.state_path, content).map_err(|e| {
            UpdaterError::fs(format!("Failed to write {}", self.state_path.display()), e)
        })
    }

    fn plugin_path(&self, plugin_file: &str) -> UpdaterResult<PathBuf> {
        if plugin_file.is_empty()
            || plugin_file.starts_with('/')
            || plugin_file.split('/').any(|part| part == ".." || part.is_empty())
        {
            return Err(UpdaterError::Config(format!("Invalid plugin file '{plugin_file}'")));
        }
        Ok(self.plugins_dir.join(plugin_file))
    }

    fn read_record(&self, relative: String, file: &Path, active: bool) -> Option<InstalledPluginRecord> {
        let header = read_header(file).ok()?;
        let name = header_field(&header, "Plugin Name")?;

        Some(InstalledPluginRecord {
            path: relative,
            name,
            version: header_field(&header, "Version").unwrap_or_default(),
            text_domain: header_field(&header, "Text Domain").unwrap_or_default(),
            active,
        })
    }
}

impl PluginHost for DirectoryHost {
    fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    fn installed_plugins(&self) -> UpdaterResult<Vec<InstalledPluginRecord>> {
        let active = self.state.lock().active.clone();
        let mut records = Vec::new();

        let entries = std::fs::read_dir(&self.plugins_dir).map_err(|e| {
            UpdaterError::fs(format!("Failed to list {}", self.plugins_dir.display()), e)
        })?;

        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let path = entry.path();

            if path.is_file() && is_php(&path) {
                let is_active = active.contains(&file_name);
                records.extend(self.read_record(file_name, &path, is_active));
            } else if path.is_dir() {
                let Ok(children) = std::fs::read_dir(&path) else { continue };
                for child in children.filter_map(Result::ok) {
                    let child_path = child.path();
                    if !child_path.is_file() || !is_php(&child_path) {
                        continue;
                    }
                    let relative =
                        format!("{}/{}", file_name, child.file_name().to_string_lossy());
                    let is_active = active.contains(&relative);
                    records.extend(self.read_record(relative, &child_path, is_active));
                }
            }
        }

        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn is_active(&self, plugin_file: &str) -> bool {
        self.state.lock().active.contains(plugin_file)
    }

    fn activate(&self, plugin_file: &str) -> UpdaterResult<()> {
        let path = self.plugin_path(plugin_file)?;
        if !path.is_file() {
            return Err(UpdaterError::PluginNotFound(plugin_file.to_string()));
        }

        let mut state = self.state.lock();
        if state.active.insert(plugin_file.to_string()) {
            self.save_state(&state)?;
            tracing::info!(plugin = plugin_file, "Plugin activated");
        }
        Ok(())
    }

    fn deactivate(&self, plugin_file: &str) -> UpdaterResult<()> {
        self.plugin_path(plugin_file)?;

        let mut state = self.state.lock();
        if state.active.remove(plugin_file) {
            self.save_state(&state)?;
            tracing::info!(plugin = plugin_file, "Plugin deactivated");
        }
        Ok(())
    }
}

fn is_php(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("php"))
}

fn read_header(path: &Path) -> std::io::Result<String> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?.take(HEADER_SCAN_BYTES).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Extract `Field: value` from a plugin header, ignoring comment decoration.
fn header_field(header: &str, field: &str) -> Option<String> {
    header.lines().find_map(|line| {
        let line = line.trim_start().trim_start_matches(['/', '*', '#', ' ', '\t']);
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case(field) {
            return None;
        }
        let value = value.trim().trim_end_matches("*/").trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plugin(plugins: &Path, relative: &str, name: &str, version: &str) {
        let path = plugins.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!("<?php\n/**\n * Plugin Name: {name}\n * Version: {version}\n * Text Domain: td-{name}\n */\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_lists_folder_and_single_file_plugins() {
        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        write_plugin(&plugins, "acme-seo/acme-seo.php", "Acme SEO", "1.2.0");
        write_plugin(&plugins, "hello.php", "Hello", "0.1");
        std::fs::write(plugins.join("acme-seo/helpers.php"), "<?php // no header").unwrap();
        write_plugin(&plugins, ".acme-seo.retired-x/acme-seo.php", "Stale", "0.0.1");

        let host = DirectoryHost::new(plugins, &temp_dir.path().join("state")).unwrap();
        let records = host.installed_plugins().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "acme-seo/acme-seo.php");
        assert_eq!(records[0].name, "Acme SEO");
        assert_eq!(records[0].version, "1.2.0");
        assert_eq!(records[0].text_domain, "td-Acme SEO");
        assert_eq!(records[0].folder(), Some("acme-seo"));
        assert_eq!(records[1].path, "hello.php");
        assert_eq!(records[1].folder(), None);
    }

    #[test]
    fn test_activation_persists() {
        let temp_dir = TempDir::new().unwrap();
        let plugins = temp_dir.path().join("plugins");
        let state = temp_dir.path().join("state");
        write_plugin(&plugins, "acme-seo/acme-seo.php", "Acme SEO", "1.2.0");

        {
            let host = DirectoryHost::new(plugins.clone(), &state).unwrap();
            host.activate("acme-seo/acme-seo.php").unwrap();
            assert!(host.is_active("acme-seo/acme-seo.php"));
        }

        let host = DirectoryHost::new(plugins, &state).unwrap();
        assert!(host.is_active("acme-seo/acme-seo.php"));
        assert!(host.installed_plugins().unwrap()[0].active);

        host.deactivate("acme-seo/acme-seo.php").unwrap();
        assert!(!host.is_active("acme-seo/acme-seo.php"));
    }

    #[test]
    fn test_activate_missing_plugin_fails() {
        let temp_dir = TempDir::new().unwrap();
        let host =
            DirectoryHost::new(temp_dir.path().join("plugins"), &temp_dir.path().join("s")).unwrap();

        assert!(matches!(host.activate("ghost/ghost.php"), Err(UpdaterError::PluginNotFound(_))));
        assert!(matches!(host.activate("../escape.php"), Err(UpdaterError::Config(_))));
    }

    #[test]
    fn test_header_field_parsing() {
        let header = "<?php\n/*\nPlugin Name: Widget Pro */\n * version:  2.0.1 \n";
        assert_eq!(header_field(header, "Plugin Name").as_deref(), Some("Widget Pro"));
        assert_eq!(header_field(header, "Version").as_deref(), Some("2.0.1"));
        assert_eq!(header_field(header, "Text Domain"), None);
    }
}
