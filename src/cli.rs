//! Command-line surface (spec §6, external interfaces) over the
//! `Orchestrator`: each positional URL becomes one Job, submitted with
//! shared connection/adaptive settings and run to a terminal state.
//!
//! Grounded on the teacher crate's `cli::Cli`/`TryFrom<Cli> for
//! DownloadConfig`: same clap-derive shape and URL/output resolution, widened
//! from "one URL, optional mirrors" to "one Job per URL, queued together".

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use reqwest::Url;

use multifetch::job::JobParams;

#[derive(Parser, Debug, Clone)]
#[command(name = "multifetch", author, version, about = "Concurrent, resumable, segmented HTTP download engine", long_about = None)]
pub struct Cli {
    /// Download URL(s). Each becomes its own queued job.
    #[arg(value_name = "url", required = true)]
    pub urls: Vec<String>,

    /// Output file (single URL) or destination directory (multiple URLs)
    #[arg(short, long, value_name = "path")]
    pub output: Option<PathBuf>,

    /// Connections requested per job
    #[arg(short = 'c', long = "connections", value_name = "int", default_value_t = 8)]
    pub connections: u32,

    /// Disable the adaptive connection controller for these jobs
    #[arg(long = "no-adaptive", action = ArgAction::SetTrue)]
    pub no_adaptive: bool,

    /// Path to a TOML config file overriding the built-in defaults
    #[arg(long = "config", value_name = "path")]
    pub config: Option<PathBuf>,

    /// Quiet mode: suppress progress output
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode: debug-level logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Stream progress as newline-delimited JSON instead of a terminal bar
    #[arg(long = "json", action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: Url,
    pub dest_dir: PathBuf,
    pub filename: Option<String>,
    pub params: JobParams,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn progress_mode(&self) -> ProgressMode {
        if self.json {
            ProgressMode::Json
        } else if self.quiet {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        }
    }

    /// Resolves the CLI's URLs and `--output` into one job request per URL.
    /// With a single URL, `--output` may name the destination file directly;
    /// with several, it names their shared destination directory.
    pub fn job_requests(&self) -> Result<Vec<JobRequest>> {
        if self.urls.is_empty() {
            return Err(anyhow!("at least one URL is required"));
        }
        let params = JobParams {
            requested_workers: self.connections.max(1),
            adaptive: !self.no_adaptive,
        };

        if self.urls.len() == 1 {
            let url = parse_url(&self.urls[0])?;
            let (dest_dir, filename) = match &self.output {
                Some(path) if looks_like_file_path(path) => {
                    let dest_dir = path
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    let filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    (dest_dir, filename)
                }
                Some(path) => (path.clone(), None),
                None => (PathBuf::from("."), None),
            };
            return Ok(vec![JobRequest { url, dest_dir, filename, params }]);
        }

        let dest_dir = self.output.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut requests = Vec::with_capacity(self.urls.len());
        for raw in &self.urls {
            requests.push(JobRequest {
                url: parse_url(raw)?,
                dest_dir: dest_dir.clone(),
                filename: None,
                params: params.clone(),
            });
        }
        Ok(requests)
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid URL: {raw}"))?;
    if url.scheme() != "https" {
        return Err(anyhow!("unsupported URL scheme: {} (only https is accepted)", url.scheme()));
    }
    Ok(url)
}

/// A path with a file-like last segment (has an extension, or simply doesn't
/// already exist as a directory) is treated as an explicit destination file
/// rather than a directory.
fn looks_like_file_path(path: &Path) -> bool {
    if path.is_dir() {
        return false;
    }
    path.extension().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_mode_defaults_to_text() {
        let cli = Cli::try_parse_from(["multifetch", "https://example.com/file.bin"]).expect("parse");
        assert_eq!(cli.progress_mode(), ProgressMode::Text);
    }

    #[test]
    fn progress_mode_respects_quiet_and_json() {
        let cli = Cli::try_parse_from(["multifetch", "https://example.com/f", "--quiet"]).unwrap();
        assert_eq!(cli.progress_mode(), ProgressMode::Quiet);
        let cli = Cli::try_parse_from(["multifetch", "https://example.com/f", "--json"]).unwrap();
        assert_eq!(cli.progress_mode(), ProgressMode::Json);
    }

    #[test]
    fn single_url_with_file_output_splits_dir_and_name() {
        let cli = Cli::try_parse_from([
            "multifetch",
            "https://example.com/archive.tar.gz",
            "--output",
            "out/renamed.tar.gz",
        ])
        .unwrap();
        let requests = cli.job_requests().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].dest_dir, PathBuf::from("out"));
        assert_eq!(requests[0].filename.as_deref(), Some("renamed.tar.gz"));
    }

    #[test]
    fn multiple_urls_share_output_as_directory() {
        let cli = Cli::try_parse_from([
            "multifetch",
            "https://example.com/a.bin",
            "https://example.com/b.bin",
            "--output",
            "downloads",
        ])
        .unwrap();
        let requests = cli.job_requests().unwrap();
        assert_eq!(requests.len(), 2);
        for req in &requests {
            assert_eq!(req.dest_dir, PathBuf::from("downloads"));
            assert!(req.filename.is_none());
        }
    }

    #[test]
    fn rejects_non_https_urls() {
        let cli = Cli::try_parse_from(["multifetch", "http://example.com/f"]).unwrap();
        assert!(cli.job_requests().is_err());
    }
}
