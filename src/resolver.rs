use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::controller::{MediaResolver, ResolveError};
use crate::models::{Resolved, Track, UNKNOWN_TRACK_TITLE};

const FALLBACK_PLAYLIST_TITLE: &str = "Playlist";

/// Resolves queries through `yt-dlp -j`. Metadata only, nothing is
/// downloaded; playlists are read with `--flat-playlist`.
pub struct YtDlpResolver {
    default_search: String,
}

#[derive(Deserialize)]
struct PlaylistEntry {
    pub url: String,
    pub title: Option<String>,
    #[serde(rename = "playlist_title")]
    pub playlist_title: Option<String>,
}

#[derive(Deserialize)]
struct SingleEntry {
    #[serde(rename = "webpage_url")]
    pub webpage_url: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
}

impl YtDlpResolver {
    pub fn new(default_search: String) -> Self {
        Self { default_search }
    }

    fn is_playlist_url(query: &str) -> bool {
        query.starts_with("http") && (query.contains("&list=") || query.contains("?list="))
    }

    async fn run_yt_dlp(args: &[&str]) -> Result<(String, String), ResolveError> {
        let output = Command::new("yt-dlp").args(args).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok((stdout, stderr))
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Resolved, ResolveError> {
        if Self::is_playlist_url(query) {
            info!("Detected playlist in {query}");

            let (stdout, stderr) =
                Self::run_yt_dlp(&["-j", "--flat-playlist", query]).await?;

            if stdout.is_empty() {
                return Err(tool_error(stderr));
            }

            parse_playlist(&stdout)
        } else {
            let (stdout, stderr) = Self::run_yt_dlp(&[
                "-j",
                "--no-playlist",
                "--default-search",
                self.default_search.as_str(),
                query,
            ])
            .await?;

            let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
                return Err(tool_error(stderr));
            };

            parse_single(line)
        }
    }
}

fn tool_error(stderr: String) -> ResolveError {
    if stderr.trim().is_empty() {
        ResolveError::NoResults
    } else {
        ResolveError::Tool(stderr.trim().to_string())
    }
}

fn parse_single(line: &str) -> Result<Resolved, ResolveError> {
    let entry: SingleEntry =
        serde_json::from_str(line).map_err(|why| ResolveError::Tool(why.to_string()))?;

    let url = entry
        .webpage_url
        .or(entry.url)
        .ok_or(ResolveError::NoResults)?;

    Ok(Resolved::One(Track {
        url,
        title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
    }))
}

fn parse_playlist(stdout: &str) -> Result<Resolved, ResolveError> {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut playlist_title: Option<String> = None;
    let tracks: Vec<Track> = lines
        .iter()
        .filter_map(|line| {
            let entry: PlaylistEntry = serde_json::from_str(line).ok()?;

            if playlist_title.is_none() {
                playlist_title = entry.playlist_title.clone();
            }

            Some(Track {
                url: entry.url,
                title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
            })
        })
        .collect();

    if tracks.len() < lines.len() {
        warn!("Some playlist entries have been skipped due to errors during parsing");
    }

    if tracks.is_empty() {
        return Err(ResolveError::NoResults);
    }

    Ok(Resolved::Playlist {
        title: playlist_title.unwrap_or_else(|| FALLBACK_PLAYLIST_TITLE.to_string()),
        tracks,
    })
}
