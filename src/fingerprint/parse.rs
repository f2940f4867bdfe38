//! Markup analysis shared by every extraction tier.

use super::{DomHash, Fingerprint};
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static CUSTOM_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(--[A-Za-z0-9_-]+)\s*:").expect("custom property pattern is valid")
});

/// Element ids used as mount points by common front-end frameworks.
const FRAMEWORK_ROOTS: &[&str] = &["__next", "__nuxt", "___gatsby", "app", "root", "svelte"];

const TRACKING_MARKERS: &[&str] = &[
    "googletagmanager.com",
    "google-analytics.com",
    "gtag(",
    "connect.facebook.net",
    "fbq(",
    "mc.yandex.ru",
    "clarity.ms",
    "hotjar.com",
];

const UPLOAD_MARKERS: &[&str] = &["/uploads/", "/upload/"];

/// Attributes whose values are checked for upload paths.
const URL_ATTRIBUTES: &[&str] = &["src", "href", "srcset", "data-src", "poster", "content", "style"];

/// Fingerprints a document. `extracted_via` is left for the caller to set.
pub fn analyze(markup: &str) -> Fingerprint {
    let document = Html::parse_document(markup);
    let root = document.root_element();

    let mut canonical = String::with_capacity(markup.len() / 4);
    write_canonical(root, &mut canonical);

    let mut fingerprint = Fingerprint {
        dom_hash: Some(DomHash::of(&canonical)),
        ..Fingerprint::default()
    };

    for node in root.descendants() {
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        inspect_element(element, &mut fingerprint);
    }

    fingerprint
}

/// Adds custom property names declared anywhere in `css`.
pub fn collect_custom_properties(css: &str, into: &mut BTreeSet<String>) {
    for capture in CUSTOM_PROPERTY.captures_iter(css) {
        into.insert(capture[1].to_string());
    }
}

fn inspect_element(element: ElementRef<'_>, fp: &mut Fingerprint) {
    let value = element.value();

    match value.name() {
        "script" => {
            if let Some(src) = value.attr("src").map(str::trim).filter(|s| !s.is_empty()) {
                if is_tracker(src) {
                    fp.uses_tracking_script = true;
                }
                if !fp.script_refs.iter().any(|existing| existing == src) {
                    fp.script_refs.push(src.to_string());
                }
            } else {
                let body: String = element.text().collect();
                if is_tracker(&body) {
                    fp.uses_tracking_script = true;
                }
            }
        }
        "style" => {
            let css: String = element.text().collect();
            collect_custom_properties(&css, &mut fp.css_variables);
        }
        "meta" => {
            if value.attr("name").is_some_and(|n| n.eq_ignore_ascii_case("generator")) {
                if let Some(generator) = value.attr("content").map(str::trim).filter(|c| !c.is_empty()) {
                    fp.template_markers.insert(format!("generator:{}", generator));
                }
            }
        }
        _ => {}
    }

    if let Some(inline) = value.attr("style") {
        collect_custom_properties(inline, &mut fp.css_variables);
    }

    if let Some(id) = value.id() {
        if FRAMEWORK_ROOTS.contains(&id) {
            fp.template_markers.insert(format!("root:#{}", id));
        }
    }

    for (name, attr_value) in value.attrs() {
        if name.starts_with("data-") {
            fp.template_markers.insert(name.to_string());
        }
        if !fp.uses_upload_path
            && URL_ATTRIBUTES.contains(&name)
            && UPLOAD_MARKERS.iter().any(|marker| attr_value.contains(marker))
        {
            fp.uses_upload_path = true;
        }
    }

    fp.class_names.extend(value.classes().map(str::to_string));
}

fn is_tracker(text: &str) -> bool {
    TRACKING_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Tag names, sorted attribute names and sorted classes, nested as in the
/// document. Text, comments and attribute values other than classes are
/// left out, so clones with different copy hash the same.
fn write_canonical(element: ElementRef<'_>, out: &mut String) {
    let value = element.value();
    let name = value.name();

    out.push('<');
    out.push_str(name);

    let mut attributes: Vec<&str> = value.attrs().map(|(name, _)| name).collect();
    attributes.sort_unstable();
    attributes.dedup();
    for attribute in attributes {
        out.push(' ');
        out.push_str(attribute);
    }

    let mut classes: Vec<&str> = value.classes().collect();
    if !classes.is_empty() {
        classes.sort_unstable();
        out.push_str(" .");
        out.push_str(&classes.join("."));
    }
    out.push('>');

    for child in element.children() {
        if let Some(child) = ElementRef::wrap(child) {
            write_canonical(child, out);
        }
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLONE_A: &str = r#"<!doctype html>
<html>
<head>
  <meta name="generator" content="CasinoKit 2.1">
  <style>:root { --brand-main: #f0c; --brand-accent:#0cf } .hero { color: var(--brand-main); }</style>
  <script src="/static/js/app.js?v=17"></script>
  <script src="https://www.googletagmanager.com/gtag/js?id=G-1"></script>
  <script src="/static/js/app.js?v=17"></script>
</head>
<body>
  <div id="__next" data-theme="dark" class="wrap main">
    <h1 class="title">White Cat Casino</h1>
    <img src="/wp-content/uploads/2024/logo.png" style="--logo-size: 32px">
  </div>
</body>
</html>"#;

    #[test]
    fn test_analyze_extracts_all_fields() {
        let fp = analyze(CLONE_A);

        let vars: Vec<&str> = fp.css_variables.iter().map(String::as_str).collect();
        assert_eq!(vars, vec!["--brand-accent", "--brand-main", "--logo-size"]);

        assert_eq!(
            fp.script_refs,
            vec![
                "/static/js/app.js?v=17".to_string(),
                "https://www.googletagmanager.com/gtag/js?id=G-1".to_string(),
            ]
        );

        assert!(fp.template_markers.contains("generator:CasinoKit 2.1"));
        assert!(fp.template_markers.contains("root:#__next"));
        assert!(fp.template_markers.contains("data-theme"));

        assert!(fp.class_names.contains("wrap"));
        assert!(fp.class_names.contains("title"));
        assert!(fp.uses_upload_path);
        assert!(fp.uses_tracking_script);
        assert!(fp.dom_hash.is_some());
        assert!(fp.extracted_via.is_none());
    }

    #[test]
    fn test_dom_hash_ignores_text_content() {
        let clone_b = CLONE_A.replace("White Cat Casino", "Black Dog Bets");
        assert_eq!(analyze(CLONE_A).dom_hash, analyze(&clone_b).dom_hash);
    }

    #[test]
    fn test_dom_hash_changes_with_structure() {
        let altered = CLONE_A.replace("<h1 class=\"title\">", "<h2 class=\"title\">").replace("</h1>", "</h2>");
        assert_ne!(analyze(CLONE_A).dom_hash, analyze(&altered).dom_hash);
    }

    #[test]
    fn test_dom_hash_ignores_attribute_order() {
        let a = r#"<html><body><a href="/x" rel="nofollow" class="b a">x</a></body></html>"#;
        let b = r#"<html><body><a class="a b" rel="me" href="/y">y</a></body></html>"#;
        assert_eq!(analyze(a).dom_hash, analyze(b).dom_hash);
    }

    #[test]
    fn test_inline_tracker_and_plain_page() {
        let fp = analyze("<html><body><script>fbq('init', '1');</script><p>hi</p></body></html>");
        assert!(fp.uses_tracking_script);
        assert!(fp.script_refs.is_empty());
        assert!(!fp.uses_upload_path);

        let plain = analyze("<html><body><p>hello</p></body></html>");
        assert!(!plain.uses_tracking_script);
        assert!(plain.template_markers.is_empty());
    }

    #[test]
    fn test_collect_custom_properties_skips_references() {
        let mut vars = BTreeSet::new();
        collect_custom_properties("a { color: var(--ref); --decl : 1px; }", &mut vars);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["--decl".to_string()]);
    }
}
