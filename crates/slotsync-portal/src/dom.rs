//! Small helpers over `scraper` trees: folded text, visibility, stable selectors.

use scraper::{ElementRef, Html, Selector};
use slotsync_core::dates::fold_accents;

pub fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased, accent-free, whitespace-collapsed text for keyword matching.
pub fn fold(text: &str) -> String {
    fold_accents(&collapse(text)).to_lowercase()
}

pub fn element_text(el: ElementRef<'_>) -> String {
    collapse(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn select<'a>(doc: &'a Html, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(sel) => doc.select(&sel).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn select_within<'a>(el: ElementRef<'a>, css: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(css) {
        Ok(sel) => el.select(&sel).collect(),
        Err(_) => Vec::new(),
    }
}

/// Trimmed attribute value, `None` when absent or blank.
pub fn attr<'a>(el: ElementRef<'a>, name: &str) -> Option<&'a str> {
    el.value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn tag(el: ElementRef<'_>) -> &str {
    el.value().name()
}

/// Input `type`, lowercased, defaulting to `text`.
pub fn input_type(el: ElementRef<'_>) -> String {
    attr(el, "type")
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "text".to_string())
}

fn hidden_by_itself(el: ElementRef<'_>) -> bool {
    let value = el.value();
    if value.attr("hidden").is_some() {
        return true;
    }
    if tag(el) == "input" && input_type(el) == "hidden" {
        return true;
    }
    if attr(el, "aria-hidden").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return true;
    }
    if let Some(style) = attr(el, "style") {
        let style: String = style
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }
    value
        .classes()
        .any(|c| matches!(c, "hidden" | "hide" | "d-none" | "invisible"))
}

/// Visible unless the element or one of its ancestors is hidden by markup.
pub fn is_visible(el: ElementRef<'_>) -> bool {
    if hidden_by_itself(el) {
        return false;
    }
    !el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(hidden_by_itself)
}

pub fn is_editable(el: ElementRef<'_>) -> bool {
    el.value().attr("readonly").is_none() && el.value().attr("disabled").is_none()
}

fn is_css_ident(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn css_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Positional path from `<html>` using `:nth-of-type`, valid in both scraper and browsers.
pub fn css_path(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    let mut current = Some(el);
    while let Some(node) = current {
        let name = tag(node);
        let parent = node.parent().and_then(ElementRef::wrap);
        match parent {
            Some(parent_el) => {
                let index = parent_el
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|sibling| tag(*sibling) == name)
                    .position(|sibling| sibling.id() == node.id())
                    .map_or(1, |i| i + 1);
                parts.push(format!("{name}:nth-of-type({index})"));
            }
            None => parts.push(name.to_string()),
        }
        current = parent;
    }
    parts.reverse();
    parts.join(" > ")
}

/// Shortest selector that resolves to exactly `el` within `doc`.
pub fn selector_for(doc: &Html, el: ElementRef<'_>) -> String {
    let unique = |candidate: &str| {
        let hits = select(doc, candidate);
        hits.len() == 1 && hits[0].id() == el.id()
    };

    if let Some(id) = attr(el, "id") {
        let candidate = if is_css_ident(id) {
            format!("#{id}")
        } else {
            format!("[id=\"{}\"]", css_string(id))
        };
        if unique(&candidate) {
            return candidate;
        }
    }
    if let Some(name) = attr(el, "name") {
        let candidate = format!("{}[name=\"{}\"]", tag(el), css_string(name));
        if unique(&candidate) {
            return candidate;
        }
    }
    css_path(el)
}

/// Whole-word match for single words (prefix match from five letters on),
/// substring match for phrases. Both sides are folded.
pub fn text_matches(text: &str, keyword: &str) -> bool {
    let text = fold(text);
    let keyword = fold(keyword);
    if keyword.is_empty() {
        return false;
    }
    if keyword.contains(' ') {
        return text.contains(&keyword);
    }
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .any(|word| word == keyword || (keyword.len() >= 5 && word.starts_with(&keyword)))
}

pub fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}
