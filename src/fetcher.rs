#![forbid(unsafe_code)]

//! Media extraction boundary.
//!
//! All protocol and format negotiation is delegated to the external `yt-dlp`
//! executable; this module only decides what to ask it for and where the
//! result lands. The [`MediaFetcher`] trait is the seam the HTTP layer
//! programs against so handler tests can swap in a canned implementation.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::storage::{StorageRoot, media_file_name};

const YT_DLP_PROGRAM: &str = "yt-dlp";
const SOCKET_TIMEOUT_SECS: u32 = 10;
const MAX_FILESIZE: &str = "500m";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
const EXTRACTOR_ARGS: &str = "youtube:skip=dash,hls;player_client=android,web";

/// A completed fetch: the bare stored filename plus the metadata the
/// extractor reported for it.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub file_name: String,
    pub title: String,
    pub ext: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The extractor could not resolve the URL to media metadata.
    #[error("extraction failed: {0}")]
    Extraction(String),
    /// Metadata resolved but the media transfer itself failed.
    #[error("download failed: {0}")]
    Download(String),
    /// The extractor reported success yet the expected file never appeared.
    #[error("extractor finished but {0} was not written")]
    MissingOutput(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Turns a URL into a locally stored file, or a reported failure. Blocking;
/// callers on the async side wrap it in `spawn_blocking`.
pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedMedia, FetchError>;
}

/// Subset of `yt-dlp --dump-single-json` we need to name the output file.
#[derive(Deserialize)]
struct MediaProbe {
    title: Option<String>,
    fulltitle: Option<String>,
    ext: Option<String>,
}

pub struct YtDlpFetcher {
    program: PathBuf,
    root: StorageRoot,
}

impl YtDlpFetcher {
    pub fn new(root: StorageRoot) -> Self {
        Self::with_program(PathBuf::from(YT_DLP_PROGRAM), root)
    }

    /// Points the fetcher at an alternative executable, e.g. a stub script
    /// in tests.
    pub fn with_program(program: PathBuf, root: StorageRoot) -> Self {
        Self { program, root }
    }

    fn fetch_at(&self, url: &str, requested_at: i64) -> Result<FetchedMedia, FetchError> {
        let probe = self.probe(url)?;

        let title = probe
            .fulltitle
            .or(probe.title)
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| "video".to_string());
        let ext = probe
            .ext
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| "mp4".to_string());

        let file_name = media_file_name(requested_at, &title, &ext);
        let output_path = self.root.dir().join(&file_name);

        self.download(url, &output_path)?;

        // yt-dlp exits zero even when size or format filtering leaves
        // nothing behind, so the postcondition has to be checked here.
        if !output_path.exists() {
            return Err(FetchError::MissingOutput(file_name));
        }

        info!(%url, file = %file_name, "download complete");
        Ok(FetchedMedia {
            file_name,
            title,
            ext,
        })
    }

    /// Runs `yt-dlp --dump-single-json --skip-download` to learn the media
    /// title and container extension before any bytes are transferred.
    fn probe(&self, url: &str) -> Result<MediaProbe, FetchError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--socket-timeout")
            .arg(SOCKET_TIMEOUT_SECS.to_string())
            .arg("--user-agent")
            .arg(USER_AGENT)
            .arg("--extractor-args")
            .arg(EXTRACTOR_ARGS)
            .arg(url);

        let output = command
            .output()
            .map_err(|err| FetchError::Extraction(format!("launching {YT_DLP_PROGRAM}: {err}")))?;

        if !output.status.success() {
            return Err(FetchError::Extraction(command_failure(
                "metadata probe",
                url,
                &output.stderr,
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::Extraction(format!("unusable metadata for {url}: {err}")))
    }

    /// Runs the actual transfer into `output_path`, mirroring the probe's
    /// network options.
    fn download(&self, url: &str, output_path: &Path) -> Result<(), FetchError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--format")
            .arg("best")
            .arg("--no-playlist")
            .arg("--output")
            .arg(output_path)
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--max-filesize")
            .arg(MAX_FILESIZE)
            .arg("--no-check-certificates")
            .arg("--socket-timeout")
            .arg(SOCKET_TIMEOUT_SECS.to_string())
            .arg("--user-agent")
            .arg(USER_AGENT)
            .arg("--extractor-args")
            .arg(EXTRACTOR_ARGS)
            .arg(url);

        let output = command
            .output()
            .map_err(|err| FetchError::Download(format!("launching {YT_DLP_PROGRAM}: {err}")))?;

        if !output.status.success() {
            return Err(FetchError::Download(command_failure(
                "download",
                url,
                &output.stderr,
            )));
        }

        Ok(())
    }
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedMedia, FetchError> {
        info!(%url, "starting download");
        self.fetch_at(url, Utc::now().timestamp())
    }
}

fn command_failure(stage: &str, url: &str, stderr: &[u8]) -> String {
    let detail = String::from_utf8_lossy(stderr);
    let detail = detail.trim();
    if detail.is_empty() {
        format!("{stage} command failed for {url}")
    } else {
        format!("{stage} command failed for {url}: {detail}")
    }
}
