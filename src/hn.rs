use crate::error::{ FetchError, FetchResult };
use crate::registry::TaskRegistry;
use crate::task::UpdateFn;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;

const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";

/// One Hacker News item as served by the Firebase API. Stories, comments,
/// jobs and polls all share this shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Story {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub by: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub descendants: i64,
    #[serde(default)]
    pub kids: Vec<u64>,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub deleted: bool,
}

pub fn item_url(id: u64) -> String {
    format!("{}/item/{}.json", API_BASE, id)
}

pub fn top_stories_url() -> String {
    format!("{}/topstories.json", API_BASE)
}

/// Best-effort read of a story through the cache. Returns the currently
/// cached story (None when cold) and reports the refreshed one through
/// `on_update`.
pub fn get_story(
    registry: &Arc<TaskRegistry>,
    id: u64,
    on_update: impl Fn(FetchResult<Story>) + Send + Sync + 'static
) -> FetchResult<Option<Story>> {
    let url = item_url(id);
    let callback_url = url.clone();
    let callback: UpdateFn = Arc::new(move |result| {
        let typed = result.and_then(|value| {
            serde_json::from_value(value).map_err(|e| FetchError::Parse {
                url: callback_url.clone(),
                reason: e.to_string(),
            })
        });
        on_update(typed);
    });

    let value = registry.fetch(&url, callback)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

/// Fetch a story and walk its comment tree, warming the cache for every
/// reachable kid. Deleted items and items without kids end the walk.
pub fn get_story_recursively(registry: &Arc<TaskRegistry>, id: u64) -> FetchResult<()> {
    let walker = registry.clone();
    let current = get_story(registry, id, move |result| {
        if let Ok(story) = result {
            walk_kids(&walker, &story);
        }
    })?;

    if let Some(story) = current {
        walk_kids(registry, &story);
    }
    Ok(())
}

fn walk_kids(registry: &Arc<TaskRegistry>, story: &Story) {
    if story.deleted {
        return;
    }
    for &kid in &story.kids {
        if let Err(e) = get_story_recursively(registry, kid) {
            log::warn!("Failed to warm item {}: {}", kid, e);
        }
    }
}
