//! Title normalization.
//!
//! Release-style file names (`Show.Name.S01E02.1080p.WEB-DL.x264-GRP.mkv`)
//! are reduced to a clean title plus the episode, year and resolution tags
//! found in them.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::processor::{ItemPatch, QueueItem, Stage, StageFailure, StageHandler, TitleInfo};

static GROUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\{[^}]*\}").expect("valid regex"));

static EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})\s?E(\d{1,3})\b|\b(\d{1,2})x(\d{2,3})\b").expect("valid regex")
});

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?\b((?:19|20)\d{2})\b\)?").expect("valid regex"));

static RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(480p|576p|720p|1080p|1080i|2160p|4k)\b").expect("valid regex")
});

static RELEASE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(blu-?ray|bdrip|brrip|web-?dl|web-?rip|hdtv|dvdrip|hdrip|remux|x26[45]|h\.?26[45]|hevc|xvid|hdr|proper|repack|extended|unrated|aac|ac3|dts|ddp?5\.1)\b",
    )
    .expect("valid regex")
});

/// Parse a file stem into title information.
///
/// The title is everything before the first episode, year, resolution or
/// release tag. Returns `None` when no title text is left.
pub fn parse_title(stem: &str) -> Option<TitleInfo> {
    let without_groups = GROUP_TAG.replace_all(stem, " ");
    let text: String = without_groups
        .chars()
        .map(|c| if c == '.' || c == '_' { ' ' } else { c })
        .collect();

    let episode = EPISODE.captures(&text);
    let (season, episode_number, episode_at) = match &episode {
        Some(caps) => {
            let season = caps.get(1).or_else(|| caps.get(3));
            let number = caps.get(2).or_else(|| caps.get(4));
            let start = caps.get(0).map(|m| m.start());
            (
                season.and_then(|m| m.as_str().parse().ok()),
                number.and_then(|m| m.as_str().parse().ok()),
                start,
            )
        }
        None => (None, None, None),
    };

    // A leading year is usually part of the title ("2001 A Space Odyssey").
    let year_match = YEAR
        .captures_iter(&text)
        .find(|caps| caps.get(0).is_some_and(|m| m.start() > 0));
    let year = year_match
        .as_ref()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let year_at = year_match.as_ref().and_then(|caps| caps.get(0)).map(|m| m.start());

    let resolution_match = RESOLUTION.find(&text);
    let resolution = resolution_match.map(|m| m.as_str().to_ascii_lowercase());

    let cut = [
        episode_at,
        year_at,
        resolution_match.map(|m| m.start()),
        RELEASE_TAG.find(&text).map(|m| m.start()),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(text.len());

    let title = clean_title(&text[..cut]);
    if title.is_empty() {
        return None;
    }

    Some(TitleInfo {
        title,
        episodic: season.is_some() && episode_number.is_some(),
        season,
        episode: episode_number,
        year,
        resolution,
    })
}

fn clean_title(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '-' || c == '(' || c == ' ' || c == '[')
        .to_string()
}

/// Title stage handler.
#[derive(Debug, Default)]
pub struct TitleHandler;

impl TitleHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageHandler for TitleHandler {
    fn stage(&self) -> Stage {
        Stage::Title
    }

    async fn handle(&self, item: &QueueItem) -> Result<ItemPatch, StageFailure> {
        // Set by a trouble resolution; take it as given.
        if let Some(info) = &item.title_info {
            if info.title.trim().is_empty() {
                return Err(StageFailure::trouble("supplied title is empty"));
            }
            return Ok(ItemPatch::new()
                .with_name(info.display_name())
                .with_title_info(info.clone()));
        }

        let stem = item
            .source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(info) = parse_title(&stem) else {
            return Err(StageFailure::trouble(format!(
                "could not derive a title from '{}'",
                stem
            )));
        };

        debug!(item_id = %item.id, title = %info.title, episodic = info.episodic, "Normalized title");
        Ok(ItemPatch::new()
            .with_name(info.display_name())
            .with_title_info(info))
    }
}
