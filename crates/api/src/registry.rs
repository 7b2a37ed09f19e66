//! Read-only container registry boundary.
//!
//! Repository and image metadata shown next to the cluster graph. Cloud-backed
//! implementations live outside this workspace; [`StaticRegistry`] serves fixed
//! data for tests and offline use.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub uri: String,
    pub created_at: Option<DateTime<Utc>>,
    pub tag_mutability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSummary {
    pub repository: String,
    pub digest: String,
    pub tags: Vec<String>,
    pub size_bytes: u64,
    pub pushed_at: DateTime<Utc>,
}

/// One page of a listing. `next_token` is opaque; pass it back to continue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

#[async_trait::async_trait]
pub trait RegistryApi: Send + Sync {
    async fn list_repositories(&self, max_results: usize, next_token: Option<&str>) -> ApiResult<Page<Repository>>;

    async fn describe_repository(&self, name: &str) -> ApiResult<Repository>;

    /// Images of one repository, or of every repository when `repository` is `None`.
    async fn list_images(&self, repository: Option<&str>) -> ApiResult<Vec<ImageSummary>>;

    /// Distinct tags of a repository, sorted.
    async fn list_tags(&self, repository: &str) -> ApiResult<Vec<String>>;
}

/// In-memory registry with fixed contents.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    repos: BTreeMap<String, (Repository, Vec<ImageSummary>)>,
}

impl StaticRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_repository(mut self, repo: Repository) -> Self {
        self.repos.entry(repo.name.clone()).or_insert_with(|| (repo, Vec::new()));
        self
    }

    /// Add an image; its repository must have been added first.
    pub fn with_image(mut self, image: ImageSummary) -> ApiResult<Self> {
        let (_, images) = self.repos.get_mut(&image.repository).ok_or_else(|| ApiError::NotFound(format!("repository {}", image.repository)))?;
        images.push(image);
        images.sort_by(|a, b| b.pushed_at.cmp(&a.pushed_at));
        Ok(self)
    }

    fn images_of(&self, name: &str) -> ApiResult<&[ImageSummary]> {
        self.repos.get(name).map(|(_, imgs)| imgs.as_slice()).ok_or_else(|| ApiError::NotFound(format!("repository {}", name)))
    }
}

#[async_trait::async_trait]
impl RegistryApi for StaticRegistry {
    async fn list_repositories(&self, max_results: usize, next_token: Option<&str>) -> ApiResult<Page<Repository>> {
        if max_results == 0 {
            return Err(ApiError::Validation("max_results must be positive".into()));
        }
        let start = match next_token {
            Some(t) => t.parse::<usize>().map_err(|_| ApiError::Validation(format!("invalid next_token: {}", t)))?,
            None => 0,
        };
        let items: Vec<Repository> = self.repos.values().skip(start).take(max_results).map(|(r, _)| r.clone()).collect();
        let end = start + items.len();
        let next_token = (end < self.repos.len()).then(|| end.to_string());
        Ok(Page { items, next_token })
    }

    async fn describe_repository(&self, name: &str) -> ApiResult<Repository> {
        self.repos.get(name).map(|(r, _)| r.clone()).ok_or_else(|| ApiError::NotFound(format!("repository {}", name)))
    }

    async fn list_images(&self, repository: Option<&str>) -> ApiResult<Vec<ImageSummary>> {
        match repository {
            Some(name) => Ok(self.images_of(name)?.to_vec()),
            None => Ok(self.repos.values().flat_map(|(_, imgs)| imgs.iter().cloned()).collect()),
        }
    }

    async fn list_tags(&self, repository: &str) -> ApiResult<Vec<String>> {
        let mut tags: Vec<String> = self.images_of(repository)?.iter().flat_map(|i| i.tags.iter().cloned()).collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }
}
