//! Named credential profiles from the local AWS config files.

use std::path::Path;

pub const DEFAULT_PROFILE: &str = "default";

/// Section names of an ini-style file, with the `profile ` prefix used by
/// `~/.aws/config` removed.
fn section_names(content: &str) -> impl Iterator<Item = &str> {
    content.lines().filter_map(|line| {
        let name = line.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
        let name = name.strip_prefix("profile ").unwrap_or(name).trim();
        (!name.is_empty()).then_some(name)
    })
}

/// Profiles named in `<home>/.aws/config` and `<home>/.aws/credentials`, plus
/// `default`, first-seen order. Unreadable files are skipped.
pub fn discover_profiles(home: &Path) -> Vec<String> {
    let mut profiles: Vec<String> = Vec::new();
    for file in ["config", "credentials"] {
        let path = home.join(".aws").join(file);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("skipping {}: {e}", path.display());
                continue;
            }
        };
        for name in section_names(&content) {
            if !profiles.iter().any(|p| p == name) {
                profiles.push(name.to_string());
            }
        }
    }

    if !profiles.iter().any(|p| p == DEFAULT_PROFILE) {
        profiles.push(DEFAULT_PROFILE.to_string());
    }
    profiles
}

/// [`discover_profiles`] for the current user's home directory.
pub fn discover() -> Vec<String> {
    match dirs::home_dir() {
        Some(home) => discover_profiles(&home),
        None => vec![DEFAULT_PROFILE.to_string()],
    }
}
