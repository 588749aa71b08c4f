//! On-disk instance store.
//!
//! An instance is a directory under `$XDG_DATA_HOME/bubblejail/instances/`
//! holding the sandbox `home/`, the authoritative `services.toml`, and a
//! small `metadata.toml`. `edit` and `run` serialize on an advisory lock
//! file so a half-written config is never launched.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::info;

use crate::compose::RunPaths;
use crate::error::{Error, Result};
use crate::paths;
use crate::services::Service;

/// Authoritative services file name inside an instance directory.
pub const FILE_NAME_SERVICES: &str = "services.toml";
/// Instance metadata file name.
pub const FILE_NAME_METADATA: &str = "metadata.toml";

// ---------------------------------------------------------------------------
// Services config
// ---------------------------------------------------------------------------

/// Parsed `services.toml`: one table per activated service.
///
/// Tables are kept in raw form so a load/save round-trip preserves the
/// configuration exactly (modulo comments and key order).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicesConfig {
    /// Service name to its raw option table.
    pub tables: BTreeMap<String, toml::Table>,
}

impl ServicesConfig {
    /// Parses and validates a `services.toml` document.
    ///
    /// Every top-level key must be a known service and every table must
    /// satisfy the service's schema.
    pub fn parse(text: &str) -> Result<Self> {
        let root: toml::Table =
            toml::from_str(text).map_err(|e| Error::ConfigParse(e.to_string()))?;

        let mut tables = BTreeMap::new();
        for (name, value) in root {
            let table = match value {
                toml::Value::Table(table) => table,
                other => {
                    return Err(Error::ConfigParse(format!(
                        "expected a table for service [{name}], got {}",
                        other.type_str()
                    )));
                }
            };
            tables.insert(name, table);
        }

        let config = Self { tables };
        config.instantiate()?;
        Ok(config)
    }

    /// Instantiates all activated services, in deterministic name order.
    pub fn instantiate(&self) -> Result<Vec<Service>> {
        self.tables
            .iter()
            .map(|(name, table)| Service::from_table(name, table))
            .collect()
    }

    /// Serializes back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        let mut root = toml::Table::new();
        for (name, table) in &self.tables {
            root.insert(name.clone(), toml::Value::Table(table.clone()));
        }
        toml::to_string_pretty(&root).map_err(|e| Error::ConfigParse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory of named instances.
#[derive(Debug)]
pub struct InstanceStore {
    root: PathBuf,
}

impl InstanceStore {
    /// Opens (or creates) the default store under the XDG data home.
    pub fn open() -> Result<Self> {
        Self::with_root(paths::data_home()?)
    }

    /// Opens a store rooted at an explicit directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("instances"))?;
        Ok(Self { root })
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Creates a new instance, optionally seeded from a profile's
    /// service tables. Fails if the name is taken.
    pub fn create(&self, name: &str, services: Option<&ServicesConfig>) -> Result<Instance> {
        validate_name(name)?;
        let dir = self.instances_dir().join(name);
        if dir.exists() {
            return Err(Error::ConfigParse(format!(
                "instance {name:?} already exists"
            )));
        }

        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        builder.create(&dir)?;
        builder.create(dir.join("home"))?;

        let config = services.cloned().unwrap_or_default();
        let instance = Instance {
            name: name.to_owned(),
            dir,
        };
        instance.save_config(&config)?;
        info!(instance = name, "created instance");
        Ok(instance)
    }

    /// Looks up an existing instance by name.
    pub fn get(&self, name: &str) -> Result<Instance> {
        validate_name(name)?;
        let dir = self.instances_dir().join(name);
        if !dir.is_dir() {
            return Err(Error::InstanceNotFound(name.to_owned()));
        }
        Ok(Instance {
            name: name.to_owned(),
            dir,
        })
    }

    /// Names of all instances, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.instances_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Instance names become directory and socket path components.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::ConfigParse(format!(
            "invalid instance name {name:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One named instance on disk.
#[derive(Debug, Clone)]
pub struct Instance {
    name: String,
    dir: PathBuf,
}

/// Held advisory lock on an instance directory.
///
/// Released when dropped (the lock file descriptor closes).
#[derive(Debug)]
pub struct InstanceLock {
    _file: fs::File,
}

impl Instance {
    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sandbox HOME directory.
    pub fn home_dir(&self) -> PathBuf {
        self.dir.join("home")
    }

    /// Path of the authoritative `services.toml`.
    pub fn services_file(&self) -> PathBuf {
        self.dir.join(FILE_NAME_SERVICES)
    }

    fn metadata_file(&self) -> PathBuf {
        self.dir.join(FILE_NAME_METADATA)
    }

    /// Takes the advisory lock serializing `edit` against `run` startup.
    pub fn lock(&self) -> Result<InstanceLock> {
        let file = fs::File::create(self.dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(InstanceLock { _file: file })
    }

    /// Loads and validates the services config.
    pub fn load_config(&self) -> Result<ServicesConfig> {
        let text = fs::read_to_string(self.services_file()).map_err(|e| {
            Error::ConfigParse(format!("reading {}: {e}", self.services_file().display()))
        })?;
        ServicesConfig::parse(&text)
    }

    /// Writes the services config.
    pub fn save_config(&self, config: &ServicesConfig) -> Result<()> {
        fs::write(self.services_file(), config.to_toml_string()?)?;
        Ok(())
    }

    /// Per-run runtime directory under `$XDG_RUNTIME_DIR`.
    pub fn runtime_dir(&self) -> Result<PathBuf> {
        Ok(paths::runtime_dir()?.join("bubblejail").join(&self.name))
    }

    /// Socket paths for one run of this instance.
    pub fn run_paths(&self) -> Result<RunPaths> {
        Ok(RunPaths::new(self.runtime_dir()?))
    }

    /// True when a helper control socket exists for this instance.
    pub fn is_running(&self) -> bool {
        self.run_paths()
            .map(|p| {
                fs::metadata(&p.helper_socket).is_ok_and(|m| m.file_type().is_socket())
            })
            .unwrap_or(false)
    }

    // -- metadata ----------------------------------------------------------

    fn load_metadata(&self) -> BTreeMap<String, String> {
        fs::read_to_string(self.metadata_file())
            .ok()
            .and_then(|text| toml::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save_metadata_key(&self, key: &str, value: &str) -> Result<()> {
        let mut metadata = self.load_metadata();
        metadata.insert(key.to_owned(), value.to_owned());
        let text =
            toml::to_string_pretty(&metadata).map_err(|e| Error::ConfigParse(e.to_string()))?;
        fs::write(self.metadata_file(), text)?;
        Ok(())
    }

    /// Profile name used at `create` time, if any.
    pub fn creation_profile_name(&self) -> Option<String> {
        self.load_metadata().get("creation_profile_name").cloned()
    }

    /// Records the profile used at `create` time.
    pub fn set_creation_profile_name(&self, profile: &str) -> Result<()> {
        self.save_metadata_key("creation_profile_name", profile)
    }

    /// Host desktop-entry file name this instance overwrote, if any.
    pub fn desktop_entry_name(&self) -> Option<String> {
        self.load_metadata().get("desktop_entry_name").cloned()
    }

    /// Records the overwritten desktop-entry file name.
    pub fn set_desktop_entry_name(&self, entry: &str) -> Result<()> {
        self.save_metadata_key("desktop_entry_name", entry)
    }

    // -- edit --------------------------------------------------------------

    /// `$EDITOR` round-trip on the services config.
    ///
    /// The config is copied to a scratch file first; an unchanged mtime
    /// means no write-back, and the edited text must validate before it
    /// replaces the real file.
    pub async fn edit_config(&self) -> Result<()> {
        let editor =
            std::env::var("EDITOR").map_err(|_| Error::DependencyMissing("EDITOR".into()))?;

        let scratch = tempfile::Builder::new()
            .prefix("bubblejail-edit-")
            .suffix(".toml")
            .tempfile()?;
        fs::copy(self.services_file(), scratch.path())?;
        let before = fs::metadata(scratch.path())?.modified()?;

        let status = tokio::process::Command::new(&editor)
            .arg(scratch.path())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::ConfigParse(format!("{editor} exited with {status}")));
        }

        if fs::metadata(scratch.path())?.modified()? <= before {
            info!("config not modified, keeping the old one");
            return Ok(());
        }

        let new_text = fs::read_to_string(scratch.path())?;
        let config = ServicesConfig::parse(&new_text)?;

        let _lock = self.lock()?;
        self.save_config(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, InstanceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = InstanceStore::with_root(dir.path().join("bubblejail")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_lays_out_instance_directory() {
        let (_dir, store) = store();
        let instance = store.create("t1", None).unwrap();
        assert!(instance.home_dir().is_dir());
        assert!(instance.services_file().is_file());
        assert_eq!(store.list().unwrap(), vec!["t1"]);
        // Creating again under the same name fails.
        assert!(store.create("t1", None).is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (_dir, store) = store();
        for bad in ["", "../up", "a/b", ".hidden", "with space"] {
            assert!(store.create(bad, None).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn missing_instance_is_reported() {
        let (_dir, store) = store();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(_)));
    }

    #[test]
    fn config_round_trip_preserves_semantics() {
        let text = r#"
[common]
executable_name = "/bin/true"
filter_disk_sync = true

[home_share]
home_paths = ["Downloads", "Music"]
"#;
        let config = ServicesConfig::parse(text).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = ServicesConfig::parse(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn malformed_or_unknown_config_is_rejected() {
        assert!(ServicesConfig::parse("common = 3").is_err());
        assert!(ServicesConfig::parse("[unknown_service]").is_err());
        assert!(ServicesConfig::parse("[common]\nbogus_key = 1").is_err());
        assert!(ServicesConfig::parse("not = = toml").is_err());
    }

    #[test]
    fn empty_table_activates_service() {
        let config = ServicesConfig::parse("[network]").unwrap();
        let services = config.instantiate().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name(), "network");
    }

    #[test]
    fn metadata_round_trip() {
        let (_dir, store) = store();
        let instance = store.create("meta", None).unwrap();
        assert_eq!(instance.creation_profile_name(), None);
        instance.set_creation_profile_name("firefox").unwrap();
        instance.set_desktop_entry_name("firefox.desktop").unwrap();
        assert_eq!(instance.creation_profile_name().as_deref(), Some("firefox"));
        assert_eq!(
            instance.desktop_entry_name().as_deref(),
            Some("firefox.desktop")
        );
    }

    #[test]
    fn lock_is_exclusive_within_process_scope() {
        let (_dir, store) = store();
        let instance = store.create("locked", None).unwrap();
        let lock = instance.lock().unwrap();
        drop(lock);
        // Lock can be re-taken after release.
        let _again = instance.lock().unwrap();
    }
}
