//! Profile discovery and parsing.
//!
//! Profiles are immutable TOML templates consumed at `create` time. They
//! are searched in user, system, then packaged directories; the first
//! match wins, so a user profile overrides a packaged one of the same
//! name.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::instance::ServicesConfig;
use crate::paths;
use crate::services::StrList;

/// Raw profile document.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProfileData {
    services: BTreeMap<String, toml::Table>,
    dot_desktop_path: Option<StrList>,
    description: Option<String>,
    import_tips: Option<String>,
    executable_name: Option<String>,
    is_gtk_application: Option<bool>,
}

/// A parsed profile.
#[derive(Debug)]
pub struct Profile {
    /// Service tables seeded into the new instance.
    pub services: ServicesConfig,
    /// Candidate host desktop-entry paths, first existing one is used.
    pub desktop_entry_paths: Vec<PathBuf>,
    /// Human description.
    pub description: String,
    /// Hints about importing existing application data.
    pub import_tips: String,
    /// Executable name hint for shell completion.
    pub executable_name: Option<String>,
}

impl Profile {
    /// Parses a profile document and validates its service tables.
    pub fn parse(text: &str) -> Result<Self> {
        let data: ProfileData =
            toml::from_str(text).map_err(|e| Error::ConfigParse(format!("profile: {e}")))?;

        let services = ServicesConfig {
            tables: data.services,
        };
        // Surfaces schema violations at profile load, not at first run.
        services.instantiate()?;

        Ok(Self {
            services,
            desktop_entry_paths: data
                .dot_desktop_path
                .map(|p| p.to_vec().into_iter().map(PathBuf::from).collect())
                .unwrap_or_default(),
            description: data.description.unwrap_or_else(|| "No description".into()),
            import_tips: data.import_tips.unwrap_or_else(|| "None".into()),
            executable_name: data.executable_name,
        })
    }

    /// First profile-declared desktop entry that exists on this host.
    pub fn find_desktop_entry(&self) -> Option<PathBuf> {
        self.desktop_entry_paths.iter().find(|p| p.exists()).cloned()
    }
}

/// Profile directories in lookup order: user, system, packaged.
///
/// `BUBBLEJAIL_CONFDIRS` (colon-separated) replaces the whole list.
pub fn profile_dirs() -> Vec<PathBuf> {
    if let Ok(override_dirs) = std::env::var("BUBBLEJAIL_CONFDIRS") {
        return override_dirs
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(s).join("profiles"))
            .collect();
    }

    let mut dirs = Vec::new();
    if let Ok(user) = paths::config_home() {
        dirs.push(user.join("profiles"));
    }
    dirs.push(PathBuf::from(paths::SYSCONF_DIR).join("bubblejail/profiles"));
    dirs.push(PathBuf::from(paths::SHARE_DIR).join("bubblejail/profiles"));
    dirs
}

/// Finds a profile by name, honoring the lookup order.
pub fn find(name: &str) -> Result<Profile> {
    let file_name = format!("{name}.toml");
    for dir in profile_dirs() {
        let candidate = dir.join(&file_name);
        match fs::read_to_string(&candidate) {
            Ok(text) => return Profile::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::ConfigParse(format!("profile {name:?} not found")))
}

/// All discoverable profile names, first occurrence wins.
pub fn list_names() -> Vec<String> {
    let mut names = Vec::new();
    for dir in profile_dirs() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut batch: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_owned)
                } else {
                    None
                }
            })
            .collect();
        batch.sort();
        for name in batch {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_profile() {
        let profile = Profile::parse(
            r#"
description = "Firefox browser"
import_tips = "Copy ~/.mozilla into the sandbox home"
dot_desktop_path = ["/usr/share/applications/firefox.desktop"]
executable_name = "firefox"

[services.common]
executable_name = "firefox"

[services.network]

[services.wayland]
"#,
        )
        .unwrap();
        assert_eq!(profile.description, "Firefox browser");
        assert_eq!(profile.services.tables.len(), 3);
        assert_eq!(profile.executable_name.as_deref(), Some("firefox"));
    }

    #[test]
    fn invalid_service_table_fails_at_profile_load() {
        let err = Profile::parse("[services.common]\nnot_an_option = 1").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn empty_profile_is_valid() {
        let profile = Profile::parse("").unwrap();
        assert!(profile.services.tables.is_empty());
        assert_eq!(profile.description, "No description");
    }

    #[test]
    fn confdirs_override_controls_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(profiles.join("t.toml"), "[services.network]\n").unwrap();

        std::env::set_var("BUBBLEJAIL_CONFDIRS", dir.path());
        let found = find("t").unwrap();
        assert!(found.services.tables.contains_key("network"));
        assert_eq!(list_names(), vec!["t"]);
        std::env::remove_var("BUBBLEJAIL_CONFDIRS");
    }
}
