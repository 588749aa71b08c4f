//! Desktop entry generation.
//!
//! Rewrites an existing host entry (or writes a minimal one) so the
//! application launches through `bubblejail run`. Entries land in
//! `$XDG_DATA_HOME/applications/bubblejail-<name>.desktop`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::instance::Instance;
use crate::paths;

/// Resolves a desktop-entry argument: a path when it contains `/`,
/// otherwise a file name under the host applications directory.
pub fn resolve_entry_arg(arg: &str) -> Option<PathBuf> {
    let candidate = if arg.contains('/') {
        PathBuf::from(arg)
    } else {
        let file_name = if arg.ends_with(".desktop") {
            arg.to_owned()
        } else {
            format!("{arg}.desktop")
        };
        Path::new(paths::SHARE_DIR).join("applications").join(file_name)
    };
    candidate.is_file().then_some(candidate)
}

/// Writes the instance's desktop entry, rewriting `source` when given.
///
/// Returns the path of the generated entry.
pub fn write_entry(instance: &Instance, source: Option<&Path>) -> Result<PathBuf> {
    let content = match source {
        Some(source) => rewrite_entry(instance.name(), &fs::read_to_string(source)?),
        None => minimal_entry(instance.name()),
    };

    let dir = paths::applications_dir()?;
    fs::create_dir_all(&dir)?;
    let target = dir.join(format!("bubblejail-{}.desktop", instance.name()));
    fs::write(&target, content)?;

    if let Some(source) = source {
        if let Some(name) = source.file_name().and_then(|n| n.to_str()) {
            instance.set_desktop_entry_name(name)?;
        }
    }

    info!(entry = %target.display(), "wrote desktop entry");
    Ok(target)
}

/// Prefixes `Exec=` lines with the sandbox launcher and renames the
/// entry, preserving everything else.
fn rewrite_entry(instance_name: &str, original: &str) -> String {
    let mut out = String::with_capacity(original.len());
    let mut in_main_group = false;

    for line in original.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_main_group = trimmed == "[Desktop Entry]";
            out.push_str(line);
        } else if let Some(exec) = trimmed.strip_prefix("Exec=") {
            out.push_str(&format!("Exec=bubblejail run {instance_name} -- {exec}"));
        } else if in_main_group && trimmed.starts_with("Name=") {
            let original_name = trimmed.trim_start_matches("Name=");
            out.push_str(&format!("Name={original_name} (bubble)"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn minimal_entry(instance_name: &str) -> String {
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={instance_name} (bubble)\n\
         Exec=bubblejail run {instance_name} --\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_prefixes_exec_and_renames() {
        let original = "[Desktop Entry]\n\
                        Name=Firefox\n\
                        Exec=firefox %u\n\
                        Icon=firefox\n\
                        [Desktop Action new-window]\n\
                        Name=New Window\n\
                        Exec=firefox --new-window\n";
        let rewritten = rewrite_entry("ff", original);

        assert!(rewritten.contains("Exec=bubblejail run ff -- firefox %u"));
        assert!(rewritten.contains("Exec=bubblejail run ff -- firefox --new-window"));
        assert!(rewritten.contains("Name=Firefox (bubble)"));
        // Action names outside [Desktop Entry] stay untouched.
        assert!(rewritten.contains("Name=New Window\n"));
        assert!(rewritten.contains("Icon=firefox"));
    }

    #[test]
    fn minimal_entry_is_launchable() {
        let entry = minimal_entry("t1");
        assert!(entry.starts_with("[Desktop Entry]"));
        assert!(entry.contains("Exec=bubblejail run t1 --"));
        assert!(entry.contains("Name=t1 (bubble)"));
    }
}
