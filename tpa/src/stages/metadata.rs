//! Metadata lookup.
//!
//! The handler asks a [`MetadataProvider`] for the item's title. The bundled
//! provider talks to the OMDb API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MetadataConfig;
use crate::processor::{ItemMetadata, ItemPatch, QueueItem, Stage, StageFailure, StageHandler};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// What to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQuery {
    pub title: String,
    pub year: Option<u32>,
    /// Season and episode, for episodic items.
    pub episode: Option<(u32, u32)>,
}

impl MetadataQuery {
    pub fn for_item(item: &QueueItem) -> Self {
        match &item.title_info {
            Some(info) => Self {
                title: info.title.clone(),
                year: info.year,
                episode: info.season.zip(info.episode),
            },
            None => Self {
                title: item.name.clone(),
                year: None,
                episode: None,
            },
        }
    }
}

/// Source of item metadata.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Look up `query`. `Ok(None)` means the provider has no match.
    async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ItemMetadata>>;
}

/// OMDb (`https://www.omdbapi.com/`) client.
pub struct OmdbProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OmdbProvider {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("OMDb lookup requires an API key"))?;

        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config.base_url.clone(),
            api_key,
        })
    }

    fn query_params(&self, query: &MetadataQuery) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("apikey", self.api_key.clone()),
            ("t", query.title.clone()),
            ("plot", "short".to_string()),
        ];
        if let Some(year) = query.year {
            params.push(("y", year.to_string()));
        }
        match query.episode {
            Some((season, episode)) => {
                params.push(("type", "episode".to_string()));
                params.push(("Season", season.to_string()));
                params.push(("Episode", episode.to_string()));
            }
            None => params.push(("type", "movie".to_string())),
        }
        params
    }
}

#[async_trait]
impl MetadataProvider for OmdbProvider {
    async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ItemMetadata>> {
        let response: OmdbResponse = self
            .client
            .get(&self.base_url)
            .query(&self.query_params(query))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response.into_metadata()
    }
}

/// OMDb answers with capitalized keys and `"N/A"` for missing values.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OmdbResponse {
    response: String,
    error: Option<String>,
    title: Option<String>,
    year: Option<String>,
    runtime: Option<String>,
    plot: Option<String>,
    genre: Option<String>,
    #[serde(rename = "imdbID")]
    imdb_id: Option<String>,
}

impl OmdbResponse {
    fn into_metadata(self) -> Result<Option<ItemMetadata>> {
        if !self.response.eq_ignore_ascii_case("true") {
            let error = self.error.unwrap_or_default();
            if error.to_ascii_lowercase().contains("not found") {
                return Ok(None);
            }
            return Err(Error::Other(format!("OMDb error: {}", error)));
        }

        let Some(title) = present(self.title) else {
            return Ok(None);
        };

        Ok(Some(ItemMetadata {
            title,
            // Series report ranges such as "2005–2013".
            year: present(self.year).and_then(|y| y.get(..4).and_then(|y| y.parse().ok())),
            runtime: present(self.runtime),
            plot: present(self.plot),
            genres: present(self.genre)
                .map(|g| g.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            imdb_id: present(self.imdb_id),
        }))
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != "N/A")
}

/// Metadata lookup stage handler.
pub struct MetadataHandler {
    /// `None` when lookup is disabled; items then pass straight through.
    provider: Option<Arc<dyn MetadataProvider>>,
}

impl MetadataHandler {
    pub fn new(provider: Option<Arc<dyn MetadataProvider>>) -> Self {
        Self { provider }
    }

    pub fn with_provider(provider: Arc<dyn MetadataProvider>) -> Self {
        Self::new(Some(provider))
    }

    /// Handler configured from `config`, using OMDb when lookup is enabled.
    pub fn from_config(config: &MetadataConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::new(None));
        }
        Ok(Self::with_provider(Arc::new(OmdbProvider::new(config)?)))
    }
}

#[async_trait]
impl StageHandler for MetadataHandler {
    fn stage(&self) -> Stage {
        Stage::MetadataLookup
    }

    async fn handle(&self, item: &QueueItem) -> std::result::Result<ItemPatch, StageFailure> {
        if item.metadata.is_some() {
            return Ok(ItemPatch::new());
        }
        let Some(provider) = &self.provider else {
            return Ok(ItemPatch::new());
        };

        let query = MetadataQuery::for_item(item);
        match provider.lookup(&query).await {
            Ok(Some(metadata)) => {
                debug!(item_id = %item.id, imdb_id = ?metadata.imdb_id, "Metadata found");
                Ok(ItemPatch::new().with_metadata(metadata))
            }
            Ok(None) => Err(StageFailure::trouble(format!(
                "no metadata found for '{}'",
                query.title
            ))),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Metadata lookup failed");
                Err(StageFailure::trouble(format!("lookup failed: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::item::FileInfo;
    use crate::processor::{Queue, TitleInfo};
    use parking_lot::Mutex;
    use std::path::Path;

    struct FakeProvider {
        answer: Option<ItemMetadata>,
        fail: bool,
        seen: Mutex<Vec<MetadataQuery>>,
    }

    #[async_trait]
    impl MetadataProvider for FakeProvider {
        async fn lookup(&self, query: &MetadataQuery) -> Result<Option<ItemMetadata>> {
            self.seen.lock().push(query.clone());
            if self.fail {
                return Err(Error::Other("connection reset".to_string()));
            }
            Ok(self.answer.clone())
        }
    }

    fn fake(answer: Option<ItemMetadata>, fail: bool) -> Arc<FakeProvider> {
        Arc::new(FakeProvider {
            answer,
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn titled_item() -> QueueItem {
        let queue = Queue::new();
        queue.ingest(Path::new("/in/a.mp4"), FileInfo::default());
        let mut item = queue.items().remove(0);
        item.title_info = Some(TitleInfo {
            title: "Lost".to_string(),
            episodic: true,
            season: Some(1),
            episode: Some(4),
            ..TitleInfo::default()
        });
        item
    }

    #[test]
    fn test_omdb_response_parsing() {
        let raw = r#"{"Title":"Heat","Year":"1995","Runtime":"170 min","Plot":"N/A",
            "Genre":"Action, Crime, Drama","imdbID":"tt0113277","Response":"True"}"#;
        let metadata = serde_json::from_str::<OmdbResponse>(raw)
            .unwrap()
            .into_metadata()
            .unwrap()
            .unwrap();
        assert_eq!(metadata.title, "Heat");
        assert_eq!(metadata.year, Some(1995));
        assert_eq!(metadata.plot, None);
        assert_eq!(metadata.genres, vec!["Action", "Crime", "Drama"]);
        assert_eq!(metadata.imdb_id.as_deref(), Some("tt0113277"));
    }

    #[test]
    fn test_omdb_not_found_and_errors() {
        let not_found = r#"{"Response":"False","Error":"Movie not found!"}"#;
        let parsed = serde_json::from_str::<OmdbResponse>(not_found).unwrap();
        assert!(parsed.into_metadata().unwrap().is_none());

        let bad_key = r#"{"Response":"False","Error":"Invalid API key!"}"#;
        let parsed = serde_json::from_str::<OmdbResponse>(bad_key).unwrap();
        assert!(parsed.into_metadata().is_err());
    }

    #[test]
    fn test_omdb_query_params_for_episode() {
        let provider = OmdbProvider::new(&MetadataConfig {
            enabled: true,
            api_key: Some("k".to_string()),
            ..MetadataConfig::default()
        })
        .unwrap();
        let params = provider.query_params(&MetadataQuery::for_item(&titled_item()));
        assert!(params.contains(&("t", "Lost".to_string())));
        assert!(params.contains(&("type", "episode".to_string())));
        assert!(params.contains(&("Season", "1".to_string())));
        assert!(params.contains(&("Episode", "4".to_string())));
    }

    #[test]
    fn test_omdb_requires_key() {
        assert!(OmdbProvider::new(&MetadataConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_disabled_lookup_passes_through() {
        let handler = MetadataHandler::from_config(&MetadataConfig::default()).unwrap();
        let patch = handler.handle(&titled_item()).await.unwrap();
        assert_eq!(patch, ItemPatch::new());
    }

    #[tokio::test]
    async fn test_match_sets_metadata() {
        let answer = ItemMetadata {
            title: "Lost".to_string(),
            ..ItemMetadata::default()
        };
        let provider = fake(Some(answer.clone()), false);
        let handler = MetadataHandler::with_provider(provider.clone());

        let patch = handler.handle(&titled_item()).await.unwrap();
        assert_eq!(patch.metadata, Some(answer));
        assert_eq!(provider.seen.lock()[0].episode, Some((1, 4)));
    }

    #[tokio::test]
    async fn test_no_match_or_failure_is_trouble() {
        let handler = MetadataHandler::with_provider(fake(None, false));
        assert!(matches!(
            handler.handle(&titled_item()).await,
            Err(StageFailure::Trouble(m)) if m.contains("no metadata")
        ));

        let handler = MetadataHandler::with_provider(fake(None, true));
        assert!(matches!(
            handler.handle(&titled_item()).await,
            Err(StageFailure::Trouble(m)) if m.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn test_supplied_metadata_skips_lookup() {
        let provider = fake(None, true);
        let handler = MetadataHandler::with_provider(provider.clone());
        let mut item = titled_item();
        item.metadata = Some(ItemMetadata::default());

        handler.handle(&item).await.unwrap();
        assert!(provider.seen.lock().is_empty());
    }
}
