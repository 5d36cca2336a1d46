//! Slideshow view model.
//!
//! Owns the picture collection handle and a cursor into it. The view never
//! mutates its own copy of the pictures: uploads and deletions go through
//! the collection, and the cursor follows whatever the collection reports.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use slideshow_sync::{Collection, Optimistic, SyncError, SyncedArray};

/// Current slide plus a render-request flag.
pub struct Slideshow {
    pictures: Collection,
    cursor: Arc<AtomicUsize>,
    dirty: Arc<AtomicBool>,
}

impl Slideshow {
    pub fn new(pictures: Collection) -> Self {
        let cursor = Arc::new(AtomicUsize::new(0));
        let dirty = Arc::new(AtomicBool::new(true));

        let (c, d) = (cursor.clone(), dirty.clone());
        pictures.observe(move |change, len| {
            clamp(&c, len);
            d.store(true, Ordering::Release);
            log::debug!("re-render requested after {}", change.kind().as_str());
        });

        Self {
            pictures,
            cursor,
            dirty,
        }
    }

    pub fn pictures(&self) -> &Collection {
        &self.pictures
    }

    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Option<Value> {
        self.pictures.at(self.position())
    }

    /// Advance, wrapping to the first slide after the last.
    pub fn next(&self) -> Option<Value> {
        let len = self.pictures.len();
        if len == 0 {
            return None;
        }
        self.go_to((self.position() + 1) % len)
    }

    /// Step back, wrapping to the last slide before the first.
    pub fn previous(&self) -> Option<Value> {
        let len = self.pictures.len();
        if len == 0 {
            return None;
        }
        self.go_to((self.position() + len - 1) % len)
    }

    /// Jump to `index`. Out-of-range indices leave the cursor alone.
    pub fn go_to(&self, index: usize) -> Option<Value> {
        let picture = self.pictures.at(index)?;
        self.cursor.store(index, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        Some(picture)
    }

    pub fn add_picture(&self, name: &str, data_url: &str) -> Result<Optimistic<usize>, SyncError> {
        log::info!("uploading {name}");
        self.pictures.push(vec![json!({"name": name, "src": data_url})])
    }

    /// Delete the picture on screen.
    pub fn remove_current(&self) -> Result<Optimistic<Vec<Value>>, SyncError> {
        if self.pictures.is_empty() {
            return Err(SyncError::Empty);
        }
        let index = isize::try_from(self.position()).map_err(|_| SyncError::IndexOutOfRange {
            index: self.position(),
            len: self.pictures.len(),
        })?;
        self.pictures.splice(index, 1, Vec::new())
    }

    /// Picture names in collection order.
    pub fn thumbnails(&self) -> Vec<String> {
        self.pictures
            .to_vec()
            .iter()
            .map(|p| p["name"].as_str().unwrap_or("untitled").to_string())
            .collect()
    }

    /// `3/7 beach.jpg`, or `empty`.
    pub fn caption(&self) -> String {
        match self.current() {
            Some(picture) => format!(
                "{}/{} {}",
                self.position() + 1,
                self.pictures.len(),
                picture["name"].as_str().unwrap_or("untitled")
            ),
            None => "empty".to_string(),
        }
    }

    /// Clear and return the render-request flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

fn clamp(cursor: &AtomicUsize, len: usize) {
    let max = len.saturating_sub(1);
    let _ = cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |at| (at > max).then_some(max));
}

#[cfg(test)]
mod tests {
    use super::*;
    use slideshow_sync::{MemoryServer, Mode, SyncClient, SyncConfig};
    use tokio::time::{sleep, timeout, Duration};

    async fn slideshow(server: &MemoryServer, names: &[&str], mode: Mode) -> Slideshow {
        let pictures: Vec<Value> = names.iter().map(|n| json!({"name": n, "src": "data:,"})).collect();
        match mode {
            Mode::Document => server.seed_documents("default", "pictures", pictures),
            Mode::List => server.seed_list("default", "pictures", pictures),
        }
        let client = SyncClient::new(SyncConfig::default(), Arc::new(server.transport()));
        let collection = client.synchronize_with("pictures", mode);
        collection.ready().await.unwrap();
        Slideshow::new(collection)
    }

    async fn settle(show: &Slideshow, len: usize) {
        timeout(Duration::from_secs(2), async {
            while show.pictures().len() != len {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_navigation_wraps() {
        let server = MemoryServer::with_defaults();
        let show = slideshow(&server, &["a", "b", "c"], Mode::List).await;

        assert_eq!(show.caption(), "1/3 a");
        show.previous();
        assert_eq!(show.caption(), "3/3 c");
        show.next();
        assert_eq!(show.caption(), "1/3 a");
        assert!(show.go_to(7).is_none());
        assert_eq!(show.position(), 0);
    }

    #[tokio::test]
    async fn test_empty_show() {
        let server = MemoryServer::with_defaults();
        let show = slideshow(&server, &[], Mode::Document).await;

        assert_eq!(show.caption(), "empty");
        assert!(show.next().is_none());
        assert!(matches!(show.remove_current(), Err(SyncError::Empty)));
    }

    #[tokio::test]
    async fn test_upload_marks_dirty() {
        let server = MemoryServer::with_defaults();
        let show = slideshow(&server, &["a"], Mode::Document).await;
        show.take_dirty();

        let added = show.add_picture("b.png", "data:image/png;base64,AAAA").unwrap();
        assert_eq!(added.value, 2);
        settle(&show, 2).await;

        assert!(show.take_dirty());
        assert_eq!(show.thumbnails(), vec!["a", "b.png"]);
    }

    #[tokio::test]
    async fn test_removing_last_slide_clamps_cursor() {
        let server = MemoryServer::with_defaults();
        let show = slideshow(&server, &["a", "b", "c"], Mode::List).await;

        show.go_to(2);
        let removed = show.remove_current().unwrap();
        assert_eq!(removed.value[0]["name"], json!("c"));
        settle(&show, 2).await;

        assert_eq!(show.position(), 1);
        assert_eq!(show.caption(), "2/2 b");
    }

    #[tokio::test]
    async fn test_dropping_show_releases_subscription() {
        let server = MemoryServer::with_defaults();
        let show = slideshow(&server, &["a"], Mode::Document).await;
        assert_eq!(server.stats().bus.active_subscribers, 1);

        drop(show);
        timeout(Duration::from_secs(2), async {
            while server.stats().bus.active_subscribers != 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
