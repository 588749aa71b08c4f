//! Shell completion backend.
//!
//! The bash/fish completion scripts call
//! `bubblejail auto-complete "$COMP_LINE"` and word-split the output.
//! A tiny lookahead parse of the partial command line decides whether
//! the cursor wants a subcommand, an option, an instance, a profile, or
//! a `list` choice.

use bubblejail::{profile, InstanceStore};

const SUBCOMMANDS: &[&str] = &["create", "run", "list", "edit", "generate-desktop-entry"];
const BASE_OPTIONS: &[&str] = &["--help", "--version"];
const LIST_CHOICES: &[&str] = &["instances", "profiles", "services"];

/// Subcommands whose positional argument is an instance name.
const WANT_INSTANCE: &[&str] = &["edit", "run", "generate-desktop-entry"];

fn subcommand_options(subcommand: &str) -> Option<&'static [&'static str]> {
    match subcommand {
        "run" => Some(&[
            "--wait",
            "--debug-shell",
            "--dry-run",
            "--debug-log-dbus",
            "--debug-bwrap-args",
            "--wizard",
            "--help",
        ]),
        "create" => Some(&["--profile", "--no-desktop-entry", "--help"]),
        "list" => Some(&["--help"]),
        "edit" => Some(&["--help"]),
        "generate-desktop-entry" => Some(&["--profile", "--desktop-entry", "--help"]),
        _ => None,
    }
}

/// Completion candidates for a partial command line.
pub fn complete(comp_line: &str) -> Vec<String> {
    let mut words: Vec<&str> = comp_line.split_whitespace().collect();
    if comp_line.ends_with(char::is_whitespace) || words.is_empty() {
        words.push("");
    }
    let current = words.last().copied().unwrap_or("");

    let candidates = candidates_for(&words);
    let mut matching: Vec<String> = candidates
        .into_iter()
        .filter(|c| c.starts_with(current))
        .collect();
    matching.sort();
    matching.dedup();
    matching
}

fn candidates_for(words: &[&str]) -> Vec<String> {
    let owned = |list: &[&str]| list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
    let mut last = owned(SUBCOMMANDS);

    // Skip argv[0] ("bubblejail").
    let mut tokens = words.iter().enumerate().skip(1);

    // Base options, then the subcommand word.
    let subcommand = loop {
        let Some((_, token)) = tokens.next() else {
            return last;
        };
        if token.starts_with('-') {
            last = owned(BASE_OPTIONS);
        } else {
            break *token;
        }
    };

    let Some(options) = subcommand_options(subcommand) else {
        // Mid-word subcommand: offer subcommands, otherwise nothing.
        return if tokens.next().is_none() {
            last
        } else {
            Vec::new()
        };
    };

    let mut subject_set = false;
    loop {
        let Some((index, token)) = tokens.next() else {
            return last;
        };

        if subject_set {
            // The instance (or list choice) is set; nothing further is
            // completed.
            return Vec::new();
        }

        if token.starts_with('-') {
            last = owned(options);
            continue;
        }

        if subcommand == "list" {
            last = owned(LIST_CHOICES);
            subject_set = true;
            continue;
        }

        if index > 0 && words[index - 1] == "--profile" {
            last = profile::list_names();
            continue;
        }

        if WANT_INSTANCE.contains(&subcommand) {
            last = instance_names();
            subject_set = true;
            continue;
        }

        last = Vec::new();
    }
}

fn instance_names() -> Vec<String> {
    InstanceStore::open()
        .and_then(|store| store.list())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_offers_subcommands() {
        let candidates = complete("bubblejail ");
        assert!(candidates.contains(&"run".to_string()));
        assert!(candidates.contains(&"create".to_string()));
        assert!(candidates.contains(&"generate-desktop-entry".to_string()));
    }

    #[test]
    fn partial_subcommand_is_prefix_filtered() {
        let candidates = complete("bubblejail cr");
        assert_eq!(candidates, vec!["create"]);
    }

    #[test]
    fn dash_offers_base_options() {
        let candidates = complete("bubblejail --");
        assert_eq!(candidates, vec!["--help", "--version"]);
    }

    #[test]
    fn run_dash_offers_run_options() {
        let candidates = complete("bubblejail run --");
        assert!(candidates.contains(&"--wait".to_string()));
        assert!(candidates.contains(&"--dry-run".to_string()));
        assert!(!candidates.contains(&"--profile".to_string()));
    }

    #[test]
    fn list_offers_choices() {
        let candidates = complete("bubblejail list ");
        assert_eq!(candidates, vec!["instances", "profiles", "services"]);
    }

    #[test]
    fn after_subject_nothing_completes() {
        assert!(complete("bubblejail list instances ").is_empty());
    }
}
