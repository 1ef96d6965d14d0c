//! The read API the site calls. Every query runs over the cached post list.

use std::sync::Arc;

use crate::cache::PostCache;
use crate::error::Result;
use crate::model::{Category, FinalPost};
use crate::posts;

pub const DEFAULT_PAGE_SIZE: usize = 20;

pub struct NewsService {
    cache: Arc<PostCache>,
}

impl NewsService {
    pub fn new(cache: Arc<PostCache>) -> Self {
        Self { cache }
    }

    pub async fn published_posts(&self, page: usize, limit: usize) -> Result<Vec<FinalPost>> {
        let all = self.cache.posts().await?;
        Ok(posts::paginate(&all, page, limit))
    }

    pub async fn post_by_slug(&self, slug: &str) -> Result<Option<FinalPost>> {
        let all = self.cache.posts().await?;
        Ok(posts::find_by_slug(&all, slug).cloned())
    }

    pub async fn posts_by_category(&self, category: &str) -> Result<Vec<FinalPost>> {
        let all = self.cache.posts().await?;
        Ok(posts::filter_by_category(&all, category))
    }

    pub async fn categories(&self) -> Result<Vec<Category>> {
        let all = self.cache.posts().await?;
        Ok(posts::categories(&all))
    }

    pub async fn featured_posts(&self) -> Result<Vec<FinalPost>> {
        let all = self.cache.posts().await?;
        Ok(posts::featured(&all))
    }

    /// The most recent post.
    pub async fn breaking_news(&self) -> Result<Option<FinalPost>> {
        let all = self.cache.posts().await?;
        Ok(all.first().cloned())
    }

    pub async fn search_posts(&self, query: &str) -> Result<Vec<FinalPost>> {
        // Blank queries never touch the store
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let all = self.cache.posts().await?;
        Ok(posts::search(&all, query))
    }
}
