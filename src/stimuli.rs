//! Image stimulus supply.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "bmp", "gif"];

pub const DEFAULT_PLACEHOLDER: &str = "placeholder";

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|ext| *ext == lower)
        })
        .unwrap_or(false)
}

/// Sorted image filenames (not paths) directly under `dir`.
pub fn list_images(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).with_context(|| format!("read image dir {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_image(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Exactly `trial_count` identifiers: truncated, or padded with `placeholder`.
pub fn fit_to_trials(mut images: Vec<String>, trial_count: u32, placeholder: &str) -> Vec<String> {
    let n = trial_count as usize;
    images.truncate(n);
    images.resize(n, placeholder.to_string());
    images
}
