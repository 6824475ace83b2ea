//! Mutable document model backing the preparation pipeline.
//!
//! The page is parsed once with `scraper` and flattened into an arena of
//! element and text nodes, preserving document order. All pipeline mutations
//! (attribute edits, inline styles, the completion class) happen on this
//! arena, and the prepared page is serialized back to HTML for the capture
//! tool.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scraper::Html;

/// Shared handle to a document mutated by concurrently running loaders.
///
/// The lock is only ever held for synchronous read/mutate sections, never
/// across an await point.
pub type SharedDocument = Arc<Mutex<Document>>;

/// Opaque handle to an element node.
///
/// Ids are stable for the lifetime of the `Document` that produced them and
/// are meaningless for any other document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(usize);

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct DomNode {
    kind: NodeKind,
    children: Vec<usize>,
}

/// An in-memory page snapshot.
#[derive(Debug, Clone, Default)]
pub struct Document {
    nodes: Vec<DomNode>,
    roots: Vec<usize>,
    body: Option<usize>,
    has_doctype: bool,
}

// Elements serialized without a closing tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

// Elements whose text children must not be entity-escaped
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

impl Document {
    /// Parse an HTML string into a document.
    ///
    /// Parsing never fails: the underlying parser recovers from malformed
    /// input the same way a browser does, synthesizing `html`/`head`/`body`
    /// as needed.
    pub fn parse(html: &str) -> Document {
        let parsed = Html::parse_document(html);
        let mut doc = Document::default();
        let root = parsed.tree.root();
        for child in root.children() {
            if let Some(idx) = doc.build_node(child) {
                doc.roots.push(idx);
            }
        }
        doc
    }

    fn build_node(&mut self, node: ego_tree::NodeRef<'_, scraper::Node>) -> Option<usize> {
        match node.value() {
            scraper::Node::Doctype(_) => {
                self.has_doctype = true;
                None
            }
            scraper::Node::Text(t) => {
                let idx = self.nodes.len();
                self.nodes.push(DomNode {
                    kind: NodeKind::Text(t.text.to_string()),
                    children: Vec::new(),
                });
                Some(idx)
            }
            scraper::Node::Element(el) => {
                let tag = el.name().to_ascii_lowercase();
                let is_body = tag == "body";
                let attributes = el
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                let idx = self.nodes.len();
                self.nodes.push(DomNode {
                    kind: NodeKind::Element { tag, attributes },
                    children: Vec::new(),
                });
                if is_body && self.body.is_none() {
                    self.body = Some(idx);
                }
                let mut children = Vec::new();
                for child in node.children() {
                    if let Some(c) = self.build_node(child) {
                        children.push(c);
                    }
                }
                self.nodes[idx].children = children;
                Some(idx)
            }
            // Comments, processing instructions etc. are irrelevant to capture
            _ => None,
        }
    }

    /// Wrap the document in the shared handle used by the pipeline.
    pub fn into_shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    /// The `<body>` element, when the parsed page has one.
    pub fn body(&self) -> Option<ElementId> {
        self.body.map(ElementId)
    }

    /// All elements under `<body>` (the body itself excluded) carrying the
    /// given attribute, in document order.
    pub fn elements_with_attribute(&self, name: &str) -> Vec<ElementId> {
        let mut out = Vec::new();
        if let Some(body) = self.body {
            self.collect_with_attribute(body, name, &mut out);
        }
        out
    }

    fn collect_with_attribute(&self, idx: usize, name: &str, out: &mut Vec<ElementId>) {
        for &child in &self.nodes[idx].children {
            if let NodeKind::Element { attributes, .. } = &self.nodes[child].kind {
                if attributes.iter().any(|(k, _)| k == name) {
                    out.push(ElementId(child));
                }
            }
            self.collect_with_attribute(child, name, out);
        }
    }

    /// Tag name of an element, lowercased.
    pub fn tag_name(&self, id: ElementId) -> &str {
        match &self.nodes[id.0].kind {
            NodeKind::Element { tag, .. } => tag,
            NodeKind::Text(_) => "",
        }
    }

    /// Read an attribute value.
    pub fn attribute(&self, id: ElementId, name: &str) -> Option<&str> {
        match &self.nodes[id.0].kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    /// Set an attribute, replacing any existing value.
    pub fn set_attribute(&mut self, id: ElementId, name: &str, value: &str) {
        if let NodeKind::Element { attributes, .. } = &mut self.nodes[id.0].kind {
            if let Some(entry) = attributes.iter_mut().find(|(k, _)| k == name) {
                entry.1 = value.to_string();
            } else {
                attributes.push((name.to_string(), value.to_string()));
            }
        }
    }

    /// Remove an attribute. Returns whether it was present.
    pub fn remove_attribute(&mut self, id: ElementId, name: &str) -> bool {
        if let NodeKind::Element { attributes, .. } = &mut self.nodes[id.0].kind {
            let before = attributes.len();
            attributes.retain(|(k, _)| k != name);
            return attributes.len() != before;
        }
        false
    }

    /// Merge a declaration into the element's inline `style` attribute.
    ///
    /// Within one style attribute a later declaration of the same property
    /// wins, so appending is sufficient to override anything already there.
    pub fn append_style_declaration(&mut self, id: ElementId, property: &str, value: &str) {
        let decl = format!("{property}: {value}");
        let merged = match self.attribute(id, "style") {
            Some(existing) if !existing.trim().is_empty() => {
                let trimmed = existing.trim_end().trim_end_matches(';');
                format!("{trimmed}; {decl}")
            }
            _ => decl,
        };
        self.set_attribute(id, "style", &merged);
    }

    /// Add a class to `<body>`. Adding an already-present class is a no-op.
    pub fn add_body_class(&mut self, class: &str) {
        let Some(body) = self.body else {
            log::warn!("document has no <body>; cannot add class `{class}`");
            return;
        };
        let id = ElementId(body);
        let current = self.attribute(id, "class").unwrap_or("").to_string();
        if current.split_whitespace().any(|c| c == class) {
            return;
        }
        let merged = if current.trim().is_empty() {
            class.to_string()
        } else {
            format!("{} {class}", current.trim_end())
        };
        self.set_attribute(id, "class", &merged);
    }

    /// Whether `<body>` carries the given class.
    pub fn body_has_class(&self, class: &str) -> bool {
        let Some(body) = self.body else {
            return false;
        };
        self.attribute(ElementId(body), "class")
            .map(|c| c.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    /// Rewrite every attribute value on every element. The callback returns
    /// `Some(new_value)` to replace a value and `None` to leave it alone.
    pub fn rewrite_attribute_values<F>(&mut self, mut rewrite: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        for node in &mut self.nodes {
            if let NodeKind::Element { attributes, .. } = &mut node.kind {
                for (_, value) in attributes.iter_mut() {
                    if let Some(new) = rewrite(value) {
                        *value = new;
                    }
                }
            }
        }
    }

    /// Serialize the document back to HTML.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        if self.has_doctype {
            out.push_str("<!DOCTYPE html>");
        }
        for &root in &self.roots {
            self.write_node(root, None, &mut out);
        }
        out
    }

    fn write_node(&self, idx: usize, parent_tag: Option<&str>, out: &mut String) {
        match &self.nodes[idx].kind {
            NodeKind::Text(text) => {
                if parent_tag.map_or(false, |t| RAW_TEXT_ELEMENTS.contains(&t)) {
                    out.push_str(text);
                } else {
                    out.push_str(&escape_text(text));
                }
            }
            NodeKind::Element { tag, attributes } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for &child in &self.nodes[idx].children {
                    self.write_node(child, Some(tag), out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

// Recover the document even when a panicking mutator poisoned the lock; the
// arena itself stays structurally valid.
pub(crate) fn lock(doc: &SharedDocument) -> MutexGuard<'_, Document> {
    doc.lock().unwrap_or_else(PoisonError::into_inner)
}
