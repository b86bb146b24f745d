use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

pub const ASSETS_DIR: &str = "assets";
pub const RENDERED_HTML: &str = "rendered.html";
pub const DOM_SNAPSHOT_JSON: &str = "domsnapshot.json";
pub const SCROLL_TRIGGERS_JSON: &str = "scrolltriggers.json";
pub const GSAP_TWEENS_JSON: &str = "gsap_tweens.json";
pub const ARCHIVE_NAME: &str = "site.zip";
pub const ARCHIVE_MIME_TYPE: &str = "application/zip";
pub const DEFAULT_OUTPUT_DIR: &str = "cloned_site";

pub fn assets_dir(output_root: &Path) -> PathBuf {
    output_root.join(ASSETS_DIR)
}

pub fn archive_path(output_root: &Path) -> PathBuf {
    output_root.join(ARCHIVE_NAME)
}

/// Creates `output_root` and its `assets/` folder. With `clean`, whatever was
/// there before is removed first.
pub fn prepare_output_dir(output_root: &Path, clean: bool) -> anyhow::Result<PathBuf> {
    if clean && output_root.exists() {
        debug!("removing previous output in {:?}", output_root);
        fs::remove_dir_all(output_root)
            .context(format!("could not clean output dir {:?}", output_root))?;
    }
    let assets = assets_dir(output_root);
    fs::create_dir_all(&assets).context(format!("could not create {:?}", assets))?;
    let root = output_root
        .canonicalize()
        .context(format!("could not resolve {:?}", output_root))?;
    Ok(root)
}

pub fn file_uri(path: &Path) -> String {
    match url::Url::from_file_path(path) {
        Ok(u) => u.to_string(),
        Err(_) => format!("file://{}", path.display()),
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
