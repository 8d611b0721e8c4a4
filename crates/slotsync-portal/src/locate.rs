//! Field location by semantic role.
//!
//! Each role is described by keywords and attribute patterns; strategies are
//! tried in order (label association, button text, attribute pattern,
//! position) and the first hit wins. Nothing here depends on the portal's
//! concrete ids.

use scraper::{ElementRef, Html};

use crate::dom::{
    attr, element_text, fold, input_type, is_editable, is_visible, select, select_within,
    selector_for, tag, text_matches,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRole {
    LoginIdentifier,
    LoginContinue,
    AccessIdentifier,
    AccessSecret,
    AccessSubmit,
    LogoutAction,
    ScheduleMenuLink,
    DateText,
    DateSelect,
    QueryAction,
    BackAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    TextInput,
    PasswordInput,
    Select,
    Clickable,
}

impl ElementKind {
    fn accepts(&self, el: ElementRef<'_>) -> bool {
        match (self, tag(el)) {
            (ElementKind::TextInput, "input") => matches!(
                input_type(el).as_str(),
                "text" | "tel" | "email" | "number" | "search"
            ),
            (ElementKind::PasswordInput, "input") => input_type(el) == "password",
            (ElementKind::Select, "select") => true,
            (ElementKind::Clickable, "button" | "a") => true,
            (ElementKind::Clickable, "input") => {
                matches!(input_type(el).as_str(), "submit" | "button" | "image")
            }
            _ => false,
        }
    }

    fn candidates_css(&self) -> &'static str {
        match self {
            ElementKind::TextInput | ElementKind::PasswordInput => "input",
            ElementKind::Select => "select",
            ElementKind::Clickable => "button, input, a",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub role: FieldRole,
    pub kind: ElementKind,
    /// Matched against label text (inputs) or visible text (clickables).
    pub keywords: &'static [&'static str],
    /// Matched as substrings of id, name, placeholder, aria-label, title, class, href.
    pub attr_patterns: &'static [&'static str],
    /// Index among visible candidates of the kind, used as last resort.
    pub position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub role: FieldRole,
    pub selector: String,
    pub strategy: &'static str,
    /// Current `value` attribute of an input, when non-empty.
    pub prefilled: Option<String>,
    pub editable: bool,
}

pub trait LocateStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn find<'a>(&self, doc: &'a Html, spec: &FieldSpec) -> Option<ElementRef<'a>>;
}

fn candidates<'a>(doc: &'a Html, kind: ElementKind) -> impl Iterator<Item = ElementRef<'a>> {
    select(doc, kind.candidates_css())
        .into_iter()
        .filter(move |el| kind.accepts(*el) && is_visible(*el))
}

fn first_of_kind(root: ElementRef<'_>, kind: ElementKind) -> Option<ElementRef<'_>> {
    select_within(root, kind.candidates_css())
        .into_iter()
        .find(|el| kind.accepts(*el) && is_visible(*el))
}

fn any_keyword(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text_matches(text, k))
}

/// `<label for=..>`, a wrapping `<label>`, or a short caption cell followed by the control.
pub struct LabelAssociation;

const CAPTION_TAGS: &str = "td, th, span, div, p, strong, b, font, dt";
const MAX_CAPTION_LEN: usize = 40;

impl LocateStrategy for LabelAssociation {
    fn name(&self) -> &'static str {
        "label"
    }

    fn find<'a>(&self, doc: &'a Html, spec: &FieldSpec) -> Option<ElementRef<'a>> {
        if spec.kind == ElementKind::Clickable {
            return None;
        }
        for label in select(doc, "label") {
            if !any_keyword(&element_text(label), spec.keywords) {
                continue;
            }
            if let Some(target_id) = attr(label, "for") {
                let hit = candidates(doc, spec.kind).find(|el| attr(*el, "id") == Some(target_id));
                if hit.is_some() {
                    return hit;
                }
            }
            if let Some(nested) = first_of_kind(label, spec.kind) {
                return Some(nested);
            }
        }

        for caption in select(doc, CAPTION_TAGS) {
            let text = element_text(caption);
            if text.is_empty() || text.len() > MAX_CAPTION_LEN {
                continue;
            }
            if !any_keyword(&text, spec.keywords) {
                continue;
            }
            if let Some(nested) = first_of_kind(caption, spec.kind) {
                return Some(nested);
            }
            let hit = caption
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find_map(|sibling| {
                    if spec.kind.accepts(sibling) && is_visible(sibling) {
                        Some(sibling)
                    } else {
                        first_of_kind(sibling, spec.kind)
                    }
                });
            if hit.is_some() {
                return hit;
            }
        }
        None
    }
}

/// Visible text, `value`, `title` or `alt` of a clickable.
pub struct ButtonText;

impl LocateStrategy for ButtonText {
    fn name(&self) -> &'static str {
        "text"
    }

    fn find<'a>(&self, doc: &'a Html, spec: &FieldSpec) -> Option<ElementRef<'a>> {
        if spec.kind != ElementKind::Clickable {
            return None;
        }
        candidates(doc, spec.kind).find(|el| {
            let mut texts = vec![element_text(*el)];
            for name in ["value", "title", "alt", "aria-label"] {
                if let Some(v) = attr(*el, name) {
                    texts.push(v.to_string());
                }
            }
            texts.iter().any(|t| any_keyword(t, spec.keywords))
        })
    }
}

/// Substring match of id/name/placeholder/aria-label/title/class/href.
pub struct AttributePattern;

const PATTERN_ATTRS: &[&str] = &[
    "id",
    "name",
    "placeholder",
    "aria-label",
    "title",
    "class",
    "href",
    "onclick",
];

impl LocateStrategy for AttributePattern {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn find<'a>(&self, doc: &'a Html, spec: &FieldSpec) -> Option<ElementRef<'a>> {
        candidates(doc, spec.kind).find(|el| {
            PATTERN_ATTRS.iter().filter_map(|a| attr(*el, a)).any(|value| {
                let value = fold(value);
                spec.attr_patterns.iter().any(|p| value.contains(p))
            })
        })
    }
}

/// The n-th visible control of the kind.
pub struct Positional;

impl LocateStrategy for Positional {
    fn name(&self) -> &'static str {
        "position"
    }

    fn find<'a>(&self, doc: &'a Html, spec: &FieldSpec) -> Option<ElementRef<'a>> {
        let index = spec.position?;
        candidates(doc, spec.kind).nth(index)
    }
}

pub struct Locator {
    strategies: Vec<Box<dyn LocateStrategy>>,
    specs: Vec<FieldSpec>,
}

impl Default for Locator {
    fn default() -> Self {
        Self::standard()
    }
}

impl Locator {
    pub fn new(strategies: Vec<Box<dyn LocateStrategy>>, specs: Vec<FieldSpec>) -> Self {
        Self { strategies, specs }
    }

    pub fn standard() -> Self {
        Self::new(
            vec![
                Box::new(LabelAssociation),
                Box::new(ButtonText),
                Box::new(AttributePattern),
                Box::new(Positional),
            ],
            standard_specs(),
        )
    }

    pub fn spec(&self, role: FieldRole) -> Option<&FieldSpec> {
        self.specs.iter().find(|s| s.role == role)
    }

    pub fn locate(&self, html: &str, role: FieldRole) -> Option<Located> {
        let doc = Html::parse_document(html);
        self.locate_in(&doc, role)
    }

    pub fn locate_in(&self, doc: &Html, role: FieldRole) -> Option<Located> {
        let spec = self.spec(role)?;
        self.strategies.iter().find_map(|strategy| {
            strategy.find(doc, spec).map(|el| Located {
                role,
                selector: selector_for(doc, el),
                strategy: strategy.name(),
                prefilled: if tag(el) == "input" {
                    attr(el, "value").map(str::to_string)
                } else {
                    None
                },
                editable: is_editable(el),
            })
        })
    }

    pub fn present(&self, html: &str, role: FieldRole) -> bool {
        self.locate(html, role).is_some()
    }
}

pub fn standard_specs() -> Vec<FieldSpec> {
    const IDENTIFIER_WORDS: &[&str] = &["cpf", "usuario", "login", "identificacao", "documento"];
    const IDENTIFIER_ATTRS: &[&str] = &["cpf", "login", "usuario", "user", "documento"];
    vec![
        FieldSpec {
            role: FieldRole::LoginIdentifier,
            kind: ElementKind::TextInput,
            keywords: IDENTIFIER_WORDS,
            attr_patterns: IDENTIFIER_ATTRS,
            position: Some(0),
        },
        FieldSpec {
            role: FieldRole::LoginContinue,
            kind: ElementKind::Clickable,
            keywords: &["continuar", "avancar", "proximo", "prosseguir", "entrar", "acessar"],
            attr_patterns: &["continuar", "avancar", "proximo", "next"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::AccessIdentifier,
            kind: ElementKind::TextInput,
            keywords: IDENTIFIER_WORDS,
            attr_patterns: IDENTIFIER_ATTRS,
            position: None,
        },
        FieldSpec {
            role: FieldRole::AccessSecret,
            kind: ElementKind::PasswordInput,
            keywords: &["senha", "password"],
            attr_patterns: &["senha", "pass", "pwd"],
            position: Some(0),
        },
        FieldSpec {
            role: FieldRole::AccessSubmit,
            kind: ElementKind::Clickable,
            keywords: &["entrar", "acessar", "login", "confirmar", "ok"],
            attr_patterns: &["entrar", "login", "acessar", "submit"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::LogoutAction,
            kind: ElementKind::Clickable,
            keywords: &["sair", "logout", "desconectar", "encerrar sessao"],
            attr_patterns: &["logout", "logoff", "sair"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::ScheduleMenuLink,
            kind: ElementKind::Clickable,
            keywords: &["agendamentos", "consultar agendamento", "agenda"],
            attr_patterns: &["agendamento", "agenda"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::DateText,
            kind: ElementKind::TextInput,
            keywords: &["data", "data do atendimento", "dia"],
            attr_patterns: &["data", "date", "dtatend", "dt_"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::DateSelect,
            kind: ElementKind::Select,
            keywords: &["data", "dia", "datas disponiveis"],
            attr_patterns: &["data", "date", "dia", "dt_"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::QueryAction,
            kind: ElementKind::Clickable,
            keywords: &["consultar", "pesquisar", "buscar", "filtrar"],
            attr_patterns: &["consultar", "pesquisar", "buscar", "consulta"],
            position: None,
        },
        FieldSpec {
            role: FieldRole::BackAction,
            kind: ElementKind::Clickable,
            keywords: &["voltar", "nova consulta", "retornar"],
            attr_patterns: &["voltar", "back", "retornar"],
            position: None,
        },
    ]
}

/// Option of the `<select>` at `selector` that represents `wanted` (any of the given renderings).
pub fn find_option(html: &str, selector: &str, wanted: &[String]) -> Option<String> {
    let doc = Html::parse_document(html);
    let select_el = select(&doc, selector).into_iter().next()?;
    select_within(select_el, "option").into_iter().find_map(|option| {
        let text = element_text(option);
        let value = option.value().attr("value").unwrap_or("").trim().to_string();
        wanted
            .iter()
            .any(|w| text.contains(w.as_str()) || value == *w)
            .then(|| if value.is_empty() { text } else { value })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN: &str = r#"
        <form>
          <table>
            <tr><td>CPF:</td><td><input type="text" id="j_idt12:campo" maxlength="14"></td></tr>
            <tr><td colspan="2"><input type="submit" value="Continuar" id="j_idt12:btn"></td></tr>
          </table>
        </form>"#;

    #[test]
    fn caption_cell_associates_with_next_cell_control() {
        let locator = Locator::standard();
        let field = locator.locate(LOGIN, FieldRole::LoginIdentifier).expect("identifier");
        assert_eq!(field.strategy, "label");
        assert_eq!(field.selector, "[id=\"j_idt12:campo\"]");
        let button = locator.locate(LOGIN, FieldRole::LoginContinue).expect("continue");
        assert_eq!(button.strategy, "text");
        assert_eq!(button.selector, "[id=\"j_idt12:btn\"]");
    }

    #[test]
    fn label_for_and_attribute_patterns_are_used() {
        let html = r#"
            <label for="pw">Senha</label><input type="password" id="pw">
            <input type="text" name="txtUsuario" value="12345678909" readonly>
            <a href="/logout.jsf">encerrar</a>"#;
        let locator = Locator::standard();
        let secret = locator.locate(html, FieldRole::AccessSecret).expect("secret");
        assert_eq!(secret.selector, "#pw");
        let ident = locator.locate(html, FieldRole::AccessIdentifier).expect("identifier");
        assert_eq!(ident.strategy, "attribute");
        assert_eq!(ident.prefilled.as_deref(), Some("12345678909"));
        assert!(!ident.editable);
        let logout = locator.locate(html, FieldRole::LogoutAction).expect("logout");
        assert_eq!(logout.strategy, "attribute");
    }

    #[test]
    fn positional_fallback_only_when_configured() {
        let html = r#"<input type="text" id="a"><input type="text" id="b">"#;
        let locator = Locator::standard();
        let field = locator.locate(html, FieldRole::LoginIdentifier).expect("positional");
        assert_eq!(field.strategy, "position");
        assert_eq!(field.selector, "#a");
        assert!(locator.locate(html, FieldRole::DateText).is_none());
    }

    #[test]
    fn hidden_controls_are_ignored() {
        let html = r#"<div style="display:none"><label>Senha <input type="password" id="old"></label></div>
                      <label>Senha <input type="password" id="live"></label>"#;
        let secret = Locator::standard().locate(html, FieldRole::AccessSecret).expect("secret");
        assert_eq!(secret.selector, "#live");
    }

    #[test]
    fn options_match_by_text_or_value() {
        let html = r#"<select id="cboData"><option value="">Selecione</option>
                      <option value="45">04/11/2025</option><option>05/11/2025</option></select>"#;
        let wanted = vec!["04/11/2025".to_string()];
        assert_eq!(find_option(html, "#cboData", &wanted).as_deref(), Some("45"));
        let wanted = vec!["05/11/2025".to_string()];
        assert_eq!(find_option(html, "#cboData", &wanted).as_deref(), Some("05/11/2025"));
        let wanted = vec!["06/11/2025".to_string()];
        assert_eq!(find_option(html, "#cboData", &wanted), None);
    }
}
