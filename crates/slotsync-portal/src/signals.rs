//! Page-level signals the driver reacts to: captchas, blocking modals, error banners.

use scraper::{ElementRef, Html};

use crate::dom::{attr, element_text, fold, is_visible, select, select_within, selector_for, tag, text_matches};

const CAPTCHA_MARKERS: &[&str] = &["g-recaptcha", "h-captcha", "hcaptcha", "recaptcha", "captcha"];

/// Describes the first visible captcha widget, if any.
pub fn detect_captcha(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    for frame in select(&doc, "iframe") {
        if let Some(src) = attr(frame, "src") {
            let src_folded = src.to_ascii_lowercase();
            if src_folded.contains("recaptcha") || src_folded.contains("hcaptcha") {
                return Some(format!("captcha frame {src}"));
            }
        }
    }

    for el in select(&doc, "[class], [id], img") {
        if !is_visible(el) {
            continue;
        }
        let mut haystack = String::new();
        for name in ["class", "id", "src", "alt"] {
            if let Some(v) = attr(el, name) {
                haystack.push_str(&v.to_ascii_lowercase());
                haystack.push(' ');
            }
        }
        if let Some(marker) = CAPTCHA_MARKERS.iter().find(|m| haystack.contains(*m)) {
            return Some(format!("captcha widget <{}> ({marker})", tag(el)));
        }
    }

    let text = fold(&element_text(doc.root_element()));
    if text.contains("nao sou um robo") || text.contains("i'm not a robot") {
        return Some("captcha challenge text".to_string());
    }
    None
}

const MODAL_CONTAINERS: &str =
    ".modal, [role=dialog], [role=alertdialog], .ui-dialog, .popup, .swal2-popup, .modal-dialog, #modal";
const CLOSE_MARKERS: &str = "[data-dismiss=modal], [data-bs-dismiss=modal], .close, .btn-close, .ui-dialog-titlebar-close, .swal2-confirm";
const CLOSE_WORDS: &[&str] = &["fechar", "ok", "entendi", "ciente", "continuar", "close", "x", "\u{d7}"];

fn modal_is_open(el: ElementRef<'_>) -> bool {
    if !is_visible(el) {
        return false;
    }
    let classes: Vec<&str> = el.value().classes().collect();
    if classes.contains(&"fade") {
        return classes.iter().any(|c| matches!(*c, "show" | "in"));
    }
    true
}

/// Selector of the close control of the first open modal, if any.
pub fn find_modal_close(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    for container in select(&doc, MODAL_CONTAINERS) {
        if !modal_is_open(container) {
            continue;
        }
        let marked = select_within(container, CLOSE_MARKERS)
            .into_iter()
            .find(|el| is_visible(*el));
        let worded = || {
            select_within(container, "button, a, input[type=button], input[type=submit]")
                .into_iter()
                .filter(|el| is_visible(*el))
                .find(|el| {
                    let text = attr(*el, "value")
                        .map(str::to_string)
                        .unwrap_or_else(|| element_text(*el));
                    CLOSE_WORDS.iter().any(|w| fold(&text) == *w || text_matches(&text, w))
                })
        };
        if let Some(close) = marked.or_else(worded) {
            return Some(selector_for(&doc, close));
        }
    }
    None
}

const ERROR_CONTAINERS: &str = ".erro, .error, .alert, .alert-danger, .mensagem, .msg, .ui-messages-error, [role=alert], .text-danger";

/// Visible error banner text, for auth failure messages.
pub fn portal_error_message(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    select(&doc, ERROR_CONTAINERS)
        .into_iter()
        .filter(|el| is_visible(*el))
        .map(element_text)
        .find(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captcha_widgets_are_detected_when_visible() {
        assert!(detect_captcha(r#"<div class="g-recaptcha" data-sitekey="x"></div>"#).is_some());
        assert!(detect_captcha(r#"<iframe src="https://www.google.com/recaptcha/api2/anchor"></iframe>"#).is_some());
        assert!(detect_captcha(r#"<div style="display:none"><div id="captcha"></div></div>"#).is_none());
        assert!(detect_captcha(r#"<p>Bem-vindo</p>"#).is_none());
    }

    #[test]
    fn open_modal_close_control_is_found() {
        let html = r#"
            <div class="modal fade" id="old"><button class="close">x</button></div>
            <div class="modal fade show" id="aviso" role="dialog">
              <p>Manutenção programada</p>
              <button type="button" id="btnFecharAviso">Fechar</button>
            </div>"#;
        assert_eq!(find_modal_close(html).as_deref(), Some("#btnFecharAviso"));
        assert_eq!(find_modal_close("<div class=\"modal fade\"><a class=\"close\">x</a></div>"), None);
    }

    #[test]
    fn error_banner_text_is_extracted() {
        let html = r#"<div class="alert alert-danger" style="display:none">old</div>
                      <span class="ui-messages-error">Senha inválida.</span>"#;
        assert_eq!(portal_error_message(html).as_deref(), Some("Senha inválida."));
    }
}
