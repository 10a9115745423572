//! Display names from installed desktop entries.

use std::path::{Path, PathBuf};

/// Directories searched for `applications/<id>.desktop`, most specific first.
fn data_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::data_dir() {
        dirs.push(home);
    }
    let system = std::env::var("XDG_DATA_DIRS")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
    dirs.extend(
        system
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from),
    );
    dirs
}

/// Looks up the `Name` of the desktop entry for `app_id`.
pub fn display_name(app_id: &str) -> Option<String> {
    display_name_in(&data_dirs(), app_id)
}

/// Looks up the `Name` of the desktop entry for `app_id` in `dirs`.
pub fn display_name_in(dirs: &[PathBuf], app_id: &str) -> Option<String> {
    if app_id.is_empty() || app_id.contains('/') {
        return None;
    }
    let file_name = format!("{}.desktop", app_id);
    dirs.iter()
        .map(|dir| dir.join("applications").join(&file_name))
        .find_map(|path| read_name(&path))
}

fn read_name(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_name(&contents)
}

/// Unlocalized `Name` key of the `[Desktop Entry]` group.
fn parse_name(contents: &str) -> Option<String> {
    let mut in_entry = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        if let Some(value) = line.strip_prefix("Name") {
            if let Some(value) = value.trim_start().strip_prefix('=') {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
