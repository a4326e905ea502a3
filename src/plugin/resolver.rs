//! Matching manifest entries against installed plugins.

use std::collections::BTreeMap;

use serde::Serialize;

use super::host::InstalledPluginRecord;
use super::manifest::PluginManifestEntry;
use super::version::is_newer;

/// Which rule matched an entry to an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    FolderName,
    DisplayName,
    TextDomain,
    PathContains,
}

/// An installed plugin with a newer version available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCandidate {
    pub entry: PluginManifestEntry,
    pub installed: InstalledPluginRecord,
    pub matched_by: MatchRule,
}

/// An installed plugin already at (or beyond) the manifest version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpToDate {
    pub entry: PluginManifestEntry,
    pub installed: InstalledPluginRecord,
}

/// Outcome of resolving a manifest against the installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub updates: Vec<UpdateCandidate>,
    pub installs: Vec<PluginManifestEntry>,
    pub up_to_date: Vec<UpToDate>,
}

impl UpdatePlan {
    /// Number of pending updates.
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// Look up the update candidate for `slug`.
    pub fn update_for(&self, slug: &str) -> Option<&UpdateCandidate> {
        self.updates.iter().find(|c| c.entry.slug == slug)
    }
}

/// Build the update plan. Entries the user has no access to are left out.
pub fn resolve(manifest: &BTreeMap<String, PluginManifestEntry>, installed: &[InstalledPluginRecord]) -> UpdatePlan {
    let mut plan = UpdatePlan::default();

    for entry in manifest.values() {
        if !entry.user_has_access {
            tracing::debug!(slug = %entry.slug, "No access, excluded from plan");
            continue;
        }

        match find_installed(entry, installed) {
            None => plan.installs.push(entry.clone()),
            Some((record, rule)) => {
                if is_newer(&entry.version, &record.version) {
                    tracing::debug!(
                        slug = %entry.slug,
                        installed = %record.version,
                        available = %entry.version,
                        "Update available"
                    );
                    plan.updates.push(UpdateCandidate {
                        entry: entry.clone(),
                        installed: record.clone(),
                        matched_by: rule,
                    });
                } else {
                    plan.up_to_date.push(UpToDate { entry: entry.clone(), installed: record.clone() });
                }
            }
        }
    }

    plan
}

/// Find the installed record for `entry`. Rules are tried in priority
/// order; within a rule the first record wins.
pub fn find_installed<'a>(
    entry: &PluginManifestEntry,
    installed: &'a [InstalledPluginRecord],
) -> Option<(&'a InstalledPluginRecord, MatchRule)> {
    let slug = entry.slug.as_str();
    let in_folder = format!("{slug}/");
    let main_file = format!("/{slug}.php");

    let rules: [(MatchRule, &dyn Fn(&InstalledPluginRecord) -> bool); 4] = [
        (MatchRule::FolderName, &|r: &InstalledPluginRecord| r.folder() == Some(slug)),
        (MatchRule::DisplayName, &|r: &InstalledPluginRecord| !entry.name.is_empty() && r.name == entry.name),
        (MatchRule::TextDomain, &|r: &InstalledPluginRecord| !r.text_domain.is_empty() && r.text_domain == slug),
        (MatchRule::PathContains, &|r: &InstalledPluginRecord| r.path.contains(&in_folder) || r.path.ends_with(&main_file)),
    ];

    rules
        .iter()
        .find_map(|(rule, matches)| installed.iter().find(|&r| matches(r)).map(|r| (r, *rule)))
}
