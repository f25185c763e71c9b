//! Text cleanup before synthesis: markup is not meant to be read aloud.

use regex::Regex;
use std::sync::OnceLock;

fn html_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag pattern"))
}

fn markdown_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[.*?\]\(.*?\)").expect("valid link pattern"))
}

/// Strip HTML tags and markdown formatting, then trim.
///
/// Markdown links are dropped entirely (label included); emphasis, heading,
/// code and strike markers (`* # ` _ ~`) are removed.
pub fn preprocess_text(text: &str) -> String {
    let without_tags = html_tag().replace_all(text, "");
    let decoded = decode_entities(&without_tags);
    let without_links = markdown_link().replace_all(&decoded, "");

    without_links
        .chars()
        .filter(|c| !matches!(c, '*' | '#' | '`' | '_' | '~'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
