//! Correlation-key extraction from a replayed message's body: JSON via a
//! dotted/bracketed path, XML via XPath. Both are best-effort — a path that
//! doesn't resolve yields `None` rather than an error, matching spec §4.5's
//! "failure record is still written with whatever fields did resolve" rule.

use serde_json::Value;

/// Walk a dotted/bracketed path like `data.items[0].id` over a JSON value.
pub fn extract_json(root: &Value, path: &str) -> Option<String> {
    let mut current = root;
    for segment in split_path(path) {
        match segment {
            PathSegment::Key(k) => current = current.get(k)?,
            PathSegment::Index(i) => current = current.get(i)?,
        }
    }
    Some(scalar_to_string(current))
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Split `a.b[2].c` into `[Key("a"), Key("b"), Index(2), Key("c")]`.
fn split_path(path: &str) -> Vec<PathSegment<'_>> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        let mut rest = dotted;
        while let Some(open) = rest.find('[') {
            let (key, tail) = rest.split_at(open);
            if !key.is_empty() {
                segments.push(PathSegment::Key(key));
            }
            let close = match tail.find(']') {
                Some(c) => c,
                None => break,
            };
            if let Ok(idx) = tail[1..close].parse::<usize>() {
                segments.push(PathSegment::Index(idx));
            }
            rest = &tail[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(PathSegment::Key(rest));
        }
    }
    segments
}

/// Evaluate an XPath expression against an XML document, joining multiple
/// matched text nodes with `,` (spec §4.5). Malformed XML or an expression
/// that resolves to nothing yields `None`.
pub fn extract_xpath(xml: &str, expr: &str) -> Option<String> {
    let package = sxd_document::parser::parse(xml).ok()?;
    let document = package.as_document();
    let xpath = sxd_xpath::Factory::new().build(expr).ok()??;
    let context = sxd_xpath::Context::new();
    let value = xpath.evaluate(&context, document.root()).ok()?;

    match value {
        sxd_xpath::Value::Nodeset(nodes) => {
            let texts: Vec<String> = nodes.document_order().into_iter().map(|n| n.string_value()).collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join(","))
            }
        }
        sxd_xpath::Value::String(s) => Some(s),
        sxd_xpath::Value::Number(n) => Some(n.to_string()),
        sxd_xpath::Value::Boolean(b) => Some(b.to_string()),
    }
}
