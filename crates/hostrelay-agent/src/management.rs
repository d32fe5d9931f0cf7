//! One-shot capability management against the extensions folder
//!
//! A capability is a directory containing a `capability.json` manifest. It is
//! installed as `<extensions>/<publisher>.<name>-<version>/` next to an
//! install record, and addressed by its case-insensitive `publisher.name` id.

use crate::config::DataDirs;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Manifest file every capability directory carries
pub const MANIFEST_FILE: &str = "capability.json";

/// Record written into every installed capability
pub const INSTALL_RECORD_FILE: &str = ".hostrelay-install.json";

/// A single management directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementAction {
    /// Install from local directories
    Install(Vec<String>),
    /// Remove by id
    Uninstall(Vec<String>),
    /// Print installed ids
    List {
        /// Append `@version` to every id
        show_versions: bool,
    },
    /// Print install folders by id
    Locate(Vec<String>),
}

/// Directives collected from the command line, run in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementCommand {
    /// Directives
    pub actions: Vec<ManagementAction>,
    /// Replace already installed capabilities
    pub force: bool,
    /// Record installs as excluded from sync
    pub do_not_sync: bool,
}

/// Contents of `capability.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    /// Publisher name
    pub publisher: String,
    /// Capability name
    pub name: String,
    /// Version string
    pub version: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CapabilityManifest {
    /// `publisher.name`, lowercased
    pub fn id(&self) -> String {
        format!("{}.{}", self.publisher, self.name).to_lowercase()
    }

    /// Read the manifest in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AgentError::Management(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let manifest: Self = serde_json::from_str(&content).map_err(|e| {
            AgentError::Management(format!("Invalid manifest {}: {}", path.display(), e))
        })?;
        for (field, value) in [
            ("publisher", &manifest.publisher),
            ("name", &manifest.name),
            ("version", &manifest.version),
        ] {
            if !is_folder_safe(value) {
                return Err(AgentError::Management(format!(
                    "Manifest {} has an invalid {}: '{}'",
                    path.display(),
                    field,
                    value
                )));
            }
        }
        Ok(manifest)
    }
}

/// Manifest fields become part of the install folder name; keep them inside it
fn is_folder_safe(value: &str) -> bool {
    !value.is_empty() && !value.contains(&['/', '\\', ':'][..]) && !value.contains("..")
}

/// Install metadata stored next to an installed capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    /// Capability id
    pub id: String,
    /// Installed version
    pub version: String,
    /// Install time (unix millis)
    pub installed_at: u64,
    /// Excluded from sync
    pub do_not_sync: bool,
}

/// An installed capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCapability {
    /// Parsed manifest
    pub manifest: CapabilityManifest,
    /// Install folder
    pub path: PathBuf,
}

/// Installed capabilities under one extensions folder
pub struct CapabilityStore {
    root: PathBuf,
}

impl CapabilityStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every installed capability, sorted by id
    pub fn installed(&self) -> Result<Vec<InstalledCapability>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut installed = Vec::new();
        for entry in entries {
            let entry = entry?;
            // Staging folders of installs in progress
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            match CapabilityManifest::load(&path) {
                Ok(manifest) => installed.push(InstalledCapability { manifest, path }),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        installed.sort_by(|a, b| a.manifest.id().cmp(&b.manifest.id()));
        Ok(installed)
    }

    /// Installed capability with `id`, compared case-insensitively
    pub fn find(&self, id: &str) -> Result<Option<InstalledCapability>> {
        let wanted = id.to_lowercase();
        Ok(self.installed()?.into_iter().find(|c| c.manifest.id() == wanted))
    }

    /// Copy the capability at `source` into the store
    ///
    /// The copy is staged next to its final folder and only swapped in once
    /// complete, so a failed install leaves any installed version in place.
    pub fn install(&self, source: &Path, force: bool, do_not_sync: bool) -> Result<InstalledCapability> {
        let manifest = CapabilityManifest::load(source)?;
        let id = manifest.id();

        let existing = self.find(&id)?;
        match &existing {
            Some(existing) if !force => {
                return Err(AgentError::Management(format!(
                    "Extension '{}' v{} is already installed. Use '--force' to replace it.",
                    id, existing.manifest.version
                )));
            }
            _ => {}
        }

        let folder = format!("{}.{}-{}", manifest.publisher, manifest.name, manifest.version).to_lowercase();
        let target = self.root.join(&folder);
        std::fs::create_dir_all(&self.root)?;

        let staging = self.root.join(format!(".{}-{}", folder, Uuid::new_v4().simple()));
        let record = InstallRecord {
            id: id.clone(),
            version: manifest.version.clone(),
            installed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            do_not_sync,
        };
        if let Err(e) = stage(source, &staging, &record) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Some(existing) = existing {
            debug!("Replacing {} at {}", id, existing.path.display());
            std::fs::remove_dir_all(&existing.path)?;
        }
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        if let Err(e) = std::fs::rename(&staging, &target) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        Ok(InstalledCapability { manifest, path: target })
    }

    /// Remove the capability with `id`
    pub fn uninstall(&self, id: &str) -> Result<InstalledCapability> {
        let installed = self.find(id)?.ok_or_else(|| {
            AgentError::Management(format!("Extension '{}' is not installed.", id))
        })?;
        std::fs::remove_dir_all(&installed.path)?;
        Ok(installed)
    }
}

/// Copy `source` to `staging` and add the install record
fn stage(source: &Path, staging: &Path, record: &InstallRecord) -> Result<()> {
    copy_dir(source, staging)?;
    let record = serde_json::to_vec_pretty(record)
        .map_err(|e| AgentError::Management(format!("Cannot encode install record: {}", e)))?;
    std::fs::write(staging.join(INSTALL_RECORD_FILE), record)?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Run every directive of `command`, writing results to `out`
///
/// All items are attempted; the error lists every item that failed.
pub fn run_management<W: Write>(command: &ManagementCommand, dirs: &DataDirs, out: &mut W) -> Result<()> {
    let store = CapabilityStore::new(&dirs.extensions);
    let mut failures = Vec::new();

    for action in &command.actions {
        match action {
            ManagementAction::List { show_versions } => {
                for capability in store.installed()? {
                    if *show_versions {
                        writeln!(out, "{}@{}", capability.manifest.id(), capability.manifest.version)?;
                    } else {
                        writeln!(out, "{}", capability.manifest.id())?;
                    }
                }
            }
            ManagementAction::Install(items) => {
                writeln!(out, "Installing extensions...")?;
                for item in items {
                    let source = Path::new(item);
                    let result = if source.is_dir() {
                        store.install(source, command.force, command.do_not_sync)
                    } else {
                        Err(AgentError::Management(format!("Extension '{}' not found.", item)))
                    };
                    match result {
                        Ok(installed) => writeln!(
                            out,
                            "Extension '{}' v{} was successfully installed.",
                            installed.manifest.id(),
                            installed.manifest.version
                        )?,
                        Err(e) => failures.push(e.to_string()),
                    }
                }
            }
            ManagementAction::Uninstall(ids) => {
                for id in ids {
                    match store.uninstall(id) {
                        Ok(removed) => writeln!(
                            out,
                            "Extension '{}' was successfully uninstalled!",
                            removed.manifest.id()
                        )?,
                        Err(e) => failures.push(e.to_string()),
                    }
                }
            }
            ManagementAction::Locate(ids) => {
                for id in ids {
                    match store.find(id)? {
                        Some(found) => writeln!(out, "{}", found.path.display())?,
                        None => failures.push(format!("Extension '{}' not found.", id)),
                    }
                }
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    for failure in &failures {
        error!("{}", failure);
    }
    Err(AgentError::Management(failures.join("\n")))
}
