//! Failure diagnostics: viewport snapshot, serialized DOM and an inventory of
//! interactive elements. Capture never fails the operation that triggered it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use scraper::Html;
use serde::Serialize;
use slotsync_core::SyncError;
use slotsync_storage::{ArtifactPart, ArtifactStore, CaptureKey};
use tracing::{info, warn};

use crate::browser::BrowserPage;
use crate::dom::{attr, element_text, input_type, is_visible, select, selector_for, tag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryItem {
    pub tag: String,
    pub kind: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub text: Option<String>,
    pub placeholder: Option<String>,
    pub has_value: bool,
    pub visible: bool,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementInventory {
    pub url: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub context: String,
    pub error_kind: String,
    pub error: String,
    pub frame_count: usize,
    pub inputs: Vec<InventoryItem>,
    pub buttons: Vec<InventoryItem>,
    pub links: Vec<InventoryItem>,
}

fn item(doc: &Html, el: scraper::ElementRef<'_>) -> InventoryItem {
    let text = element_text(el);
    InventoryItem {
        tag: tag(el).to_string(),
        kind: (tag(el) == "input").then(|| input_type(el)),
        id: attr(el, "id").map(str::to_string),
        name: attr(el, "name").map(str::to_string),
        text: (!text.is_empty()).then(|| text.chars().take(80).collect()),
        placeholder: attr(el, "placeholder").map(str::to_string),
        // Values are never copied; a password may be sitting in one.
        has_value: attr(el, "value").is_some(),
        visible: is_visible(el),
        selector: selector_for(doc, el),
    }
}

/// List inputs, buttons and links of a document.
pub fn build_inventory(
    html: &str,
    url: Option<String>,
    captured_at: DateTime<Utc>,
    context: &str,
    error: &SyncError,
    frame_count: usize,
) -> ElementInventory {
    let doc = Html::parse_document(html);
    let is_button = |el: &scraper::ElementRef<'_>| {
        tag(*el) == "button"
            || (tag(*el) == "input" && matches!(input_type(*el).as_str(), "submit" | "button" | "image"))
    };

    let mut inputs = Vec::new();
    let mut buttons = Vec::new();
    for el in select(&doc, "input, select, textarea, button") {
        if is_button(&el) {
            buttons.push(item(&doc, el));
        } else {
            inputs.push(item(&doc, el));
        }
    }
    let links = select(&doc, "a")
        .into_iter()
        .map(|el| item(&doc, el))
        .collect();

    ElementInventory {
        url,
        captured_at,
        context: context.to_string(),
        error_kind: error.kind().as_str().to_string(),
        error: error.to_string(),
        frame_count,
        inputs,
        buttons,
        links,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub snapshot: Option<PathBuf>,
    pub dom: Option<PathBuf>,
    pub inventory: Option<PathBuf>,
}

impl CaptureReport {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.dom.is_none() && self.inventory.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactCapture {
    store: Option<ArtifactStore>,
}

impl ArtifactCapture {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Persist diagnostics for the page's current frame. Each piece is written
    /// independently; failures are logged and skipped.
    pub async fn capture<P: BrowserPage + ?Sized>(
        &self,
        page: &P,
        account_id: &str,
        context: &str,
        error: &SyncError,
    ) -> CaptureReport {
        let mut report = CaptureReport::default();
        let Some(store) = &self.store else {
            return report;
        };
        let captured_at = Utc::now();
        let key = CaptureKey {
            captured_at,
            account_id,
            context,
            failure_kind: error.kind().as_str(),
        };

        match page.screenshot().await {
            Ok(png) => match store.write_part(&key, ArtifactPart::Snapshot, &png).await
            {
                Ok(stored) => report.snapshot = Some(stored.absolute_path),
                Err(err) => warn!(account_id, context, error = %format!("{err:#}"), "snapshot write failed"),
            },
            Err(err) => warn!(account_id, context, error = %err, "snapshot capture failed"),
        }

        let html = match page.content().await {
            Ok(html) => Some(html),
            Err(err) => {
                warn!(account_id, context, error = %err, "dom capture failed");
                None
            }
        };

        if let Some(html) = &html {
            match store.write_part(&key, ArtifactPart::Dom, html.as_bytes()).await {
                Ok(stored) => report.dom = Some(stored.absolute_path),
                Err(err) => warn!(account_id, context, error = %format!("{err:#}"), "dom write failed"),
            }

            let url = page.current_url().await.ok();
            let frame_count = page.frame_count().await.unwrap_or(0);
            let inventory = build_inventory(html, url, captured_at, context, error, frame_count);
            match store.write_json_part(&key, ArtifactPart::Inventory, &inventory).await {
                Ok(stored) => report.inventory = Some(stored.absolute_path),
                Err(err) => warn!(account_id, context, error = %format!("{err:#}"), "inventory write failed"),
            }
        }

        if !report.is_empty() {
            info!(
                account_id,
                context,
                kind = error.kind().as_str(),
                snapshot = ?report.snapshot,
                dom = ?report.dom,
                inventory = ?report.inventory,
                "failure artifacts captured"
            );
        }
        report
    }
}
