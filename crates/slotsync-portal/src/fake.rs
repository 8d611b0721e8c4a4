//! Scripted in-memory [`BrowserPage`] for driver tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use scraper::{Html, Selector};
use slotsync_core::{SessionCookie, SyncError};

use crate::browser::BrowserPage;

#[derive(Debug, Clone, Default)]
pub struct FakeDoc {
    pub html: String,
    pub frames: Vec<FakeDoc>,
}

impl FakeDoc {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: FakeDoc) -> Self {
        self.frames.push(frame);
        self
    }

    fn at(&self, path: &[usize]) -> Option<&FakeDoc> {
        path.iter().try_fold(self, |doc, i| doc.frames.get(*i))
    }

    fn at_mut(&mut self, path: &[usize]) -> Option<&mut FakeDoc> {
        let mut doc = self;
        for i in path {
            doc = doc.frames.get_mut(*i)?;
        }
        Some(doc)
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub url: String,
    pub doc: FakeDoc,
    pub path: Vec<usize>,
    pub pages: HashMap<String, FakeDoc>,
    pub visits: Vec<String>,
    pub clicks: Vec<String>,
    pub fills: Vec<(String, String)>,
    pub selections: Vec<(String, String)>,
    pub cookies: Vec<SessionCookie>,
    pub screenshots: usize,
    pub quit: bool,
    /// Labels pushed by click handlers, for asserting which scripted paths ran.
    pub events: Vec<String>,
}

impl FakeState {
    /// Load a registered page as the top document.
    pub fn open(&mut self, url: &str) {
        let doc = self.pages.get(url).cloned().unwrap_or_else(|| FakeDoc::new("<html></html>"));
        self.url = url.to_string();
        self.doc = doc;
        self.path.clear();
    }

    pub fn replace_frame(&mut self, path: &[usize], doc: FakeDoc) {
        if let Some(slot) = self.doc.at_mut(path) {
            *slot = doc;
        }
    }

    pub fn filled(&self, selector: &str) -> Option<&str> {
        self.fills
            .iter()
            .rev()
            .find(|(s, _)| s == selector)
            .map(|(_, v)| v.as_str())
    }

    pub fn selected(&self, selector: &str) -> Option<&str> {
        self.selections
            .iter()
            .rev()
            .find(|(s, _)| s == selector)
            .map(|(_, v)| v.as_str())
    }
}

type ClickHandler = Box<dyn Fn(&mut FakeState) + Send + Sync>;
type GotoGuard = Box<dyn Fn(&FakeState, &str) -> Option<String> + Send + Sync>;

struct Handler {
    url: String,
    selector: String,
    run: ClickHandler,
}

#[derive(Default)]
struct Script {
    handlers: Vec<Handler>,
    guards: Vec<GotoGuard>,
}

#[derive(Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<FakeState>>,
    script: Arc<Mutex<Script>>,
}

fn parse_selector(selector: &str) -> Result<Selector, SyncError> {
    Selector::parse(selector).map_err(|e| SyncError::SelectorDrift(format!("bad selector {selector}: {e}")))
}

/// Index, in document order, of the first element matching `selector`.
fn element_index(html: &str, selector: &str) -> Result<Option<usize>, SyncError> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let Some(target) = doc.select(&sel).next() else {
        return Ok(None);
    };
    let all = parse_selector("*")?;
    Ok(doc.select(&all).position(|el| el.id() == target.id()))
}

fn has_option(html: &str, selector: &str, option: &str) -> Result<bool, SyncError> {
    let sel = parse_selector(selector)?;
    let options = parse_selector("option")?;
    let doc = Html::parse_document(html);
    let Some(list) = doc.select(&sel).next() else {
        return Ok(false);
    };
    let found = list.select(&options).any(|opt| {
        let text = opt.text().collect::<String>();
        opt.value().attr("value") == Some(option) || text.trim() == option
    });
    Ok(found)
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, doc: FakeDoc) -> &Self {
        self.lock().pages.insert(url.to_string(), doc);
        self
    }

    /// Run `run` when an element matched by `selector` is clicked while on `url` (`*` for any).
    pub fn on_click(
        &self,
        url: &str,
        selector: &str,
        run: impl Fn(&mut FakeState) + Send + Sync + 'static,
    ) -> &Self {
        self.script_lock().handlers.push(Handler {
            url: url.to_string(),
            selector: selector.to_string(),
            run: Box::new(run),
        });
        self
    }

    /// Redirect a navigation when `guard` returns a target URL.
    pub fn guard(&self, guard: impl Fn(&FakeState, &str) -> Option<String> + Send + Sync + 'static) -> &Self {
        self.script_lock().guards.push(Box::new(guard));
        self
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn script_lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current_html(state: &FakeState) -> Result<String, SyncError> {
        state
            .doc
            .at(&state.path)
            .map(|d| d.html.clone())
            .ok_or_else(|| SyncError::SelectorDrift("no such frame".into()))
    }

    fn require_element(state: &FakeState, selector: &str) -> Result<usize, SyncError> {
        let html = Self::current_html(state)?;
        element_index(&html, selector)?
            .ok_or_else(|| SyncError::SelectorDrift(format!("no such element: {selector}")))
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str) -> Result<(), SyncError> {
        let script = self.script_lock();
        let mut state = self.lock();
        let target = script
            .guards
            .iter()
            .find_map(|g| g(&*state, url))
            .unwrap_or_else(|| url.to_string());
        state.visits.push(url.to_string());
        state.open(&target);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, SyncError> {
        Ok(self.lock().url.clone())
    }

    async fn content(&self) -> Result<String, SyncError> {
        Self::current_html(&self.lock())
    }

    async fn frame_count(&self) -> Result<usize, SyncError> {
        let state = self.lock();
        Ok(state.doc.at(&state.path).map_or(0, |d| d.frames.len()))
    }

    async fn enter_frame(&self, index: usize) -> Result<(), SyncError> {
        let mut state = self.lock();
        let count = state.doc.at(&state.path).map_or(0, |d| d.frames.len());
        if index >= count {
            return Err(SyncError::SelectorDrift(format!("no such frame {index}")));
        }
        state.path.push(index);
        Ok(())
    }

    async fn enter_top(&self) -> Result<(), SyncError> {
        self.lock().path.clear();
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), SyncError> {
        let script = self.script_lock();
        let mut state = self.lock();
        let clicked = Self::require_element(&state, selector)?;
        state.clicks.push(selector.to_string());
        let html = Self::current_html(&state)?;
        let url = state.url.clone();
        for handler in script.handlers.iter().filter(|h| h.url == "*" || h.url == url) {
            if element_index(&html, &handler.selector)? == Some(clicked) {
                (handler.run)(&mut *state);
                break;
            }
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), SyncError> {
        let mut state = self.lock();
        Self::require_element(&state, selector)?;
        state.fills.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &str) -> Result<(), SyncError> {
        let mut state = self.lock();
        let html = Self::current_html(&state)?;
        if !has_option(&html, selector, option)? {
            return Err(SyncError::SelectorDrift(format!("option {option} not in {selector}")));
        }
        state.selections.push((selector.to_string(), option.to_string()));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SyncError> {
        self.lock().screenshots += 1;
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, SyncError> {
        Ok(self.lock().cookies.clone())
    }

    async fn add_cookies(&self, cookies: &[SessionCookie]) -> Result<(), SyncError> {
        self.lock().cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn quit(&self) -> Result<(), SyncError> {
        self.lock().quit = true;
        Ok(())
    }
}
