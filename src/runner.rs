use std::{
    path::PathBuf,
    str::FromStr,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::anyhow;
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::task;
use url::Url;

use crate::{
    archive::ArchiveAssembler,
    browser_controller::{ChromeLauncher, Launcher},
    driver::{DriverOptions, PageDriver, PageSession},
    types::{ArchiveSummary, CaptureError, ClonerError, ToolContent, ToolResult},
    utils::{
        archive_path, file_uri, human_size, prepare_output_dir, ARCHIVE_MIME_TYPE, ARCHIVE_NAME,
        DEFAULT_OUTPUT_DIR,
    },
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct RunnerOptions {
    // directory the capture is written to, created if missing
    #[builder(default = "self.default_output_dir()")]
    output_dir: PathBuf,
    // wipe the output directory before capturing
    #[builder(default = "false")]
    clean: bool,
    // zip the output directory once the capture is done
    #[builder(default = "true")]
    with_archive: bool,
    // chrome binary, falls back to $CHROME and the usual install locations
    #[builder(default = "None")]
    chrome_path: Option<PathBuf>,
    driver: DriverOptions,
}

impl RunnerOptions {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptionsBuilder {
    fn default_output_dir(&self) -> PathBuf {
        PathBuf::from(DEFAULT_OUTPUT_DIR)
    }
}

/// Result of a successful clone.
#[derive(Debug)]
pub struct CloneOutcome {
    pub session: PageSession,
    pub archive: Option<ArchiveSummary>,
}

impl CloneOutcome {
    pub fn summary(&self) -> String {
        let s = &self.session;
        let mut text = format!(
            "Site cloned into `{}`: {} resources ({})",
            s.output_root.display(),
            s.resources.len(),
            human_size(s.total_bytes())
        );
        if !s.written.is_empty() {
            text.push_str(&format!(", artifacts: {}", s.written.join(", ")));
        }
        if !s.artifacts.scroll_triggers.is_empty() || !s.artifacts.gsap_tweens.is_empty() {
            text.push_str(&format!(
                ", {} scroll triggers and {} tweens recorded",
                s.artifacts.scroll_triggers.len(),
                s.artifacts.gsap_tweens.len()
            ));
        }
        if let Some(a) = &self.archive {
            text.push_str(&format!(
                ". Archive {} holds {} files ({})",
                ARCHIVE_NAME,
                a.entries,
                human_size(a.size)
            ));
        }
        text.push('.');
        text
    }

    pub fn tool_result(&self) -> ToolResult {
        let mut content = vec![ToolContent::Text {
            text: self.summary(),
        }];
        if let Some(a) = &self.archive {
            content.push(ToolContent::ResourceLink {
                uri: file_uri(&a.path),
                name: ARCHIVE_NAME.to_string(),
                mime_type: ARCHIVE_MIME_TYPE.to_string(),
                description: format!("Zip archive of the capture of {}", self.session.target_url),
            });
        }
        ToolResult {
            content,
            is_error: false,
        }
    }
}

impl From<&ClonerError> for ToolResult {
    fn from(e: &ClonerError) -> Self {
        ToolResult::error(e.to_string())
    }
}

pub struct Runner<L: Launcher> {
    driver: PageDriver<L>,
    options: RunnerOptions,
}

impl Runner<ChromeLauncher> {
    pub fn new(options: RunnerOptions) -> anyhow::Result<Self> {
        let should_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

        let launcher = ChromeLauncher::new(
            options.chrome_path.clone(),
            options.driver.navigation_timeout(),
        );
        Ok(Runner::with_launcher(launcher, options, should_terminate))
    }
}

impl<L: Launcher> Runner<L> {
    pub fn with_launcher(
        launcher: L,
        options: RunnerOptions,
        should_terminate: Arc<AtomicBool>,
    ) -> Self {
        let driver = PageDriver::new(launcher, options.driver.clone(), should_terminate);
        Runner { driver, options }
    }

    /// Captures `url` into the output directory and, unless disabled, zips
    /// the result. A capture failure and a packaging failure are reported
    /// as distinct errors.
    pub async fn run(&self, url: &str) -> Result<CloneOutcome, ClonerError> {
        let parsed = Url::from_str(url)
            .map_err(|e| CaptureError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CaptureError::InvalidUrl(format!("{}: unsupported scheme", url)).into());
        }

        let output_root = prepare_output_dir(&self.options.output_dir, self.options.clean)
            .map_err(CaptureError::OutputDir)?;
        info!("cloning {} into {:?}", url, output_root);

        let session = self.driver.run(url, &output_root).await?;

        let archive = if self.options.with_archive {
            let dir = output_root.clone();
            let path = archive_path(&output_root);
            let summary = task::spawn_blocking(move || ArchiveAssembler::assemble(&dir, &path))
                .await
                .map_err(|e| ClonerError::Packaging(anyhow!("archive task failed: {}", e)))?
                .map_err(ClonerError::Packaging)?;
            info!(
                "archive {:?} ready, {} entries ({})",
                summary.path,
                summary.entries,
                human_size(summary.size)
            );
            Some(summary)
        } else {
            None
        };

        Ok(CloneOutcome { session, archive })
    }
}
