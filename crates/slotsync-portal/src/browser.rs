//! The browser seam. Everything above this trait works on serialized HTML and
//! CSS selectors so it can run against a real WebDriver session or a scripted fake.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use slotsync_core::{SessionCookie, SyncError};
use tracing::debug;

/// Child-frame indices from the top-level document down to a nested frame.
pub type FramePath = Vec<usize>;

pub const MAX_FRAME_DEPTH: usize = 4;
pub const MAX_FRAMES_VISITED: usize = 32;

/// A single browser tab. Operations apply to the currently entered frame.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), SyncError>;
    async fn current_url(&self) -> Result<String, SyncError>;
    /// Serialized DOM of the current frame.
    async fn content(&self) -> Result<String, SyncError>;
    async fn frame_count(&self) -> Result<usize, SyncError>;
    async fn enter_frame(&self, index: usize) -> Result<(), SyncError>;
    async fn enter_top(&self) -> Result<(), SyncError>;
    async fn click(&self, selector: &str) -> Result<(), SyncError>;
    /// Replace the value of a text input and fire its change events.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), SyncError>;
    /// Pick the option of a `<select>` whose value or visible text equals `option`.
    async fn select_option(&self, selector: &str, option: &str) -> Result<(), SyncError>;
    async fn screenshot(&self) -> Result<Vec<u8>, SyncError>;
    async fn cookies(&self) -> Result<Vec<SessionCookie>, SyncError>;
    async fn add_cookies(&self, cookies: &[SessionCookie]) -> Result<(), SyncError>;
    async fn quit(&self) -> Result<(), SyncError>;
}

#[async_trait]
impl<T: BrowserPage + ?Sized> BrowserPage for Arc<T> {
    async fn goto(&self, url: &str) -> Result<(), SyncError> {
        (**self).goto(url).await
    }
    async fn current_url(&self) -> Result<String, SyncError> {
        (**self).current_url().await
    }
    async fn content(&self) -> Result<String, SyncError> {
        (**self).content().await
    }
    async fn frame_count(&self) -> Result<usize, SyncError> {
        (**self).frame_count().await
    }
    async fn enter_frame(&self, index: usize) -> Result<(), SyncError> {
        (**self).enter_frame(index).await
    }
    async fn enter_top(&self) -> Result<(), SyncError> {
        (**self).enter_top().await
    }
    async fn click(&self, selector: &str) -> Result<(), SyncError> {
        (**self).click(selector).await
    }
    async fn fill(&self, selector: &str, value: &str) -> Result<(), SyncError> {
        (**self).fill(selector, value).await
    }
    async fn select_option(&self, selector: &str, option: &str) -> Result<(), SyncError> {
        (**self).select_option(selector, option).await
    }
    async fn screenshot(&self) -> Result<Vec<u8>, SyncError> {
        (**self).screenshot().await
    }
    async fn cookies(&self) -> Result<Vec<SessionCookie>, SyncError> {
        (**self).cookies().await
    }
    async fn add_cookies(&self, cookies: &[SessionCookie]) -> Result<(), SyncError> {
        (**self).add_cookies(cookies).await
    }
    async fn quit(&self) -> Result<(), SyncError> {
        (**self).quit().await
    }
}

/// Enter the frame at `path`, starting from the top-level document.
pub async fn enter_path<P: BrowserPage + ?Sized>(page: &P, path: &[usize]) -> Result<(), SyncError> {
    page.enter_top().await?;
    for index in path {
        page.enter_frame(*index).await?;
    }
    Ok(())
}

/// Breadth-first search over the frame tree for the first document matching `predicate`.
///
/// On a hit the page is left inside the matching frame and its path and HTML are
/// returned. On a miss the page is returned to the top-level document.
pub async fn find_frame<P, F>(page: &P, predicate: F) -> Result<Option<(FramePath, String)>, SyncError>
where
    P: BrowserPage + ?Sized,
    F: Fn(&str) -> bool + Send + Sync,
{
    let mut queue: VecDeque<FramePath> = VecDeque::from([Vec::new()]);
    let mut visited = 0usize;

    while let Some(path) = queue.pop_front() {
        if visited >= MAX_FRAMES_VISITED {
            break;
        }
        visited += 1;

        if let Err(err) = enter_path(page, &path).await {
            debug!(?path, error = %err, "frame vanished during search");
            continue;
        }
        let html = page.content().await?;
        if predicate(&html) {
            return Ok(Some((path, html)));
        }
        if path.len() >= MAX_FRAME_DEPTH {
            continue;
        }
        let children = page.frame_count().await.unwrap_or(0);
        for index in 0..children {
            let mut child = path.clone();
            child.push(index);
            queue.push_back(child);
        }
    }

    page.enter_top().await?;
    Ok(None)
}
