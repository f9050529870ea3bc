//! Markup handling for web documents: structural noise removal, primary
//! content selection, and a tag-stripping fallback.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Node, Selector};

static NOISE_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<!--.*?-->",
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?is)<style\b[^>]*>.*?</style\s*>",
        r"(?is)<noscript\b[^>]*>.*?</noscript\s*>",
        r"(?is)<nav\b[^>]*>.*?</nav\s*>",
        r"(?is)<header\b[^>]*>.*?</header\s*>",
        r"(?is)<footer\b[^>]*>.*?</footer\s*>",
        r"(?is)<aside\b[^>]*>.*?</aside\s*>",
        r"(?is)<menu\b[^>]*>.*?</menu\s*>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("noise block regex"))
    .collect()
});

/// Banner, advert and share-widget containers, matched on whole class or
/// id tokens so that `shareholder-report` or `social-responsibility` stay.
const NOISE_SELECTORS: &[&str] = &[
    ".cookie-banner",
    ".cookie-notice",
    ".cookie-consent",
    ".cookie-bar",
    "#cookie-banner",
    "#cookie-notice",
    "#cookie-consent",
    ".gdpr-banner",
    ".consent-banner",
    ".ad",
    ".ads",
    ".advert",
    ".advertisement",
    ".ad-banner",
    ".sponsored",
    ".promo",
    ".social-share",
    ".share-buttons",
    ".sharing-buttons",
    ".social-links",
    ".social-icons",
    "#social-share",
    "iframe",
];

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("entity regex"));

const MAIN_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role='main']",
    "#content",
    "#main",
    ".content",
    ".main",
    ".post-content",
    ".entry-content",
];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "table", "tr", "td", "th",
    "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "br", "dd", "dt", "figcaption",
    "body",
];

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Removes boilerplate blocks from raw markup.
#[must_use]
pub fn strip_noise(markup: &str) -> String {
    let mut out = markup.to_string();
    for pattern in NOISE_BLOCKS.iter() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, " ").into_owned();
        }
    }
    remove_noise_elements(&out)
}

fn remove_noise_elements(markup: &str) -> String {
    let mut document = Html::parse_document(markup);
    let mut unwanted = Vec::new();
    for selector in NOISE_SELECTORS {
        if let Ok(selector) = Selector::parse(selector) {
            unwanted.extend(document.select(&selector).map(|element| element.id()));
        }
    }
    if unwanted.is_empty() {
        return markup.to_string();
    }

    for id in unwanted {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    document.html()
}

/// Text of the primary content region.
///
/// A dedicated container is used only when it carries at least half of the
/// body's text; otherwise the whole body is kept so that data outside the
/// container is not lost.
#[must_use]
pub fn main_text(markup: &str) -> String {
    let document = Html::parse_document(markup);
    let body = block_text(document.root_element());

    for selector in MAIN_SELECTORS {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        if let Some(region) = document.select(&selector).next() {
            let text = block_text(region);
            if text.chars().count() * 2 >= body.chars().count() {
                return text;
            }
            break;
        }
    }

    body
}

/// Last-resort conversion: drop every tag and decode entities.
#[must_use]
pub fn strip_tags(markup: &str) -> String {
    decode_entities(&TAG.replace_all(markup, " "))
}

fn block_text(root: scraper::ElementRef<'_>) -> String {
    let mut out = String::new();
    let mut current_block = None;

    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };

        let mut skipped = false;
        let mut block = None;
        for ancestor in node.ancestors() {
            if let Node::Element(element) = ancestor.value() {
                let name = element.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    skipped = true;
                    break;
                }
                if block.is_none() && BLOCK_ELEMENTS.contains(&name) {
                    block = Some(ancestor.id());
                }
            }
        }
        if skipped || text.trim().is_empty() {
            continue;
        }

        if block != current_block {
            if !out.is_empty() {
                out.push('\n');
            }
            current_block = block;
        } else if !out.ends_with(char::is_whitespace) && !text.starts_with(char::is_whitespace) {
            out.push(' ');
        }
        out.push_str(text);
    }

    out
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&nbsp;", "\u{a0}")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&copy;", "\u{a9}")
        .replace("&ndash;", "\u{2013}")
        .replace("&mdash;", "\u{2014}");

    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures<'_>| {
        let code = &caps[1];
        let value = code
            .strip_prefix('x')
            .map_or_else(|| code.parse::<u32>().ok(), |hex| u32::from_str_radix(hex, 16).ok());
        value
            .and_then(char::from_u32)
            .map_or_else(|| caps[0].to_string(), String::from)
    });

    numeric.replace("&amp;", "&")
}
