//! Host side of the query document exposed to scripts as `doc`.
//!
//! A [`QueryDocument`] is a node-set over an immutable parsed tree. Every
//! traversal returns a new node-set; nothing here fails, absent markup
//! just yields empty sets and empty strings.

use anyhow::{anyhow, Error};
use ego_tree::{NodeId, NodeRef};
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::HashSet;
use std::rc::Rc;
use std::str::FromStr;

/// Sibling and ancestor axes a node-set can be moved along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Next,
    NextAll,
    NextUntil,
    Prev,
    PrevAll,
    PrevUntil,
    Siblings,
    Children,
    Parent,
}

impl FromStr for Axis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "next" => Self::Next,
            "nextAll" => Self::NextAll,
            "nextUntil" => Self::NextUntil,
            "prev" => Self::Prev,
            "prevAll" => Self::PrevAll,
            "prevUntil" => Self::PrevUntil,
            "siblings" => Self::Siblings,
            "children" => Self::Children,
            "parent" => Self::Parent,
            other => return Err(anyhow!("unknown traversal '{}'", other)),
        })
    }
}

#[derive(Clone)]
pub struct QueryDocument {
    doc: Rc<Html>,
    nodes: Vec<NodeId>,
}

impl QueryDocument {
    /// Parse a page. The root node-set is the document node itself.
    pub fn parse(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let root = doc.tree.root().id();
        Self {
            doc: Rc::new(doc),
            nodes: vec![root],
        }
    }

    pub fn empty() -> Self {
        Self {
            doc: Rc::new(Html::new_document()),
            nodes: Vec::new(),
        }
    }

    fn derive(&self, nodes: Vec<NodeId>) -> Self {
        Self {
            doc: Rc::clone(&self.doc),
            nodes,
        }
    }

    fn node_refs(&self) -> impl Iterator<Item = NodeRef<'_, Node>> + '_ {
        self.nodes.iter().filter_map(|id| self.doc.tree.get(*id))
    }

    fn first_node(&self) -> Option<NodeRef<'_, Node>> {
        self.node_refs().next()
    }

    fn first_element(&self) -> Option<ElementRef<'_>> {
        self.first_node().and_then(ElementRef::wrap)
    }

    /// Collect element nodes produced per source node, dropping repeats.
    fn collect<'a, F, I>(&'a self, mut step: F) -> Self
    where
        F: FnMut(NodeRef<'a, Node>) -> I,
        I: Iterator<Item = NodeRef<'a, Node>>,
    {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for node in self.node_refs() {
            for found in step(node) {
                if found.value().is_element() && seen.insert(found.id()) {
                    nodes.push(found.id());
                }
            }
        }
        self.derive(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Text content of every node in the set, concatenated in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in self.node_refs() {
            for descendant in node.descendants() {
                if let Node::Text(text) = descendant.value() {
                    out.push_str(text);
                }
            }
        }
        out
    }

    /// Outer markup of the first node.
    pub fn html(&self) -> String {
        let Some(node) = self.first_node() else {
            return String::new();
        };
        match node.value() {
            Node::Document | Node::Fragment => self.doc.html(),
            Node::Element(_) => ElementRef::wrap(node).map(|el| el.html()).unwrap_or_default(),
            Node::Text(text) => (**text).to_string(),
            Node::Comment(comment) => format!("<!--{}-->", &**comment),
            _ => String::new(),
        }
    }

    /// Tag name of the first node, empty when it is not an element.
    pub fn name(&self) -> String {
        self.first_element()
            .map(|el| el.value().name().to_string())
            .unwrap_or_default()
    }

    pub fn attr(&self, name: &str) -> String {
        self.first_element()
            .and_then(|el| el.value().attr(name))
            .unwrap_or_default()
            .to_string()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.first_element()
            .is_some_and(|el| el.value().attr(name).is_some())
    }

    /// True when any element in the set carries `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.node_refs()
            .filter_map(ElementRef::wrap)
            .any(|el| el.value().classes().any(|c| c == class))
    }

    pub fn first(&self) -> Self {
        self.get(0)
    }

    pub fn last(&self) -> Self {
        self.get(-1)
    }

    /// The node at `index`; negative indices count from the end.
    pub fn get(&self, index: i64) -> Self {
        let len = self.nodes.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if (0..len).contains(&index) {
            self.derive(vec![self.nodes[index as usize]])
        } else {
            self.derive(Vec::new())
        }
    }

    /// Descendants matching a CSS selector. An invalid selector matches nothing.
    pub fn find(&self, selector: &str) -> Self {
        let Ok(selector) = Selector::parse(selector) else {
            return self.derive(Vec::new());
        };
        self.collect(|node| {
            let selector = &selector;
            node.descendants().skip(1).filter(move |candidate| {
                ElementRef::wrap(*candidate).is_some_and(|el| selector.matches(&el))
            })
        })
    }

    pub fn next(&self) -> Self {
        self.traverse(Axis::Next, None)
    }

    pub fn next_all(&self) -> Self {
        self.traverse(Axis::NextAll, None)
    }

    pub fn next_until(&self, selector: &str) -> Self {
        self.traverse(Axis::NextUntil, Some(selector))
    }

    pub fn prev(&self) -> Self {
        self.traverse(Axis::Prev, None)
    }

    pub fn prev_all(&self) -> Self {
        self.traverse(Axis::PrevAll, None)
    }

    pub fn prev_until(&self, selector: &str) -> Self {
        self.traverse(Axis::PrevUntil, Some(selector))
    }

    pub fn siblings(&self) -> Self {
        self.traverse(Axis::Siblings, None)
    }

    pub fn children(&self) -> Self {
        self.traverse(Axis::Children, None)
    }

    pub fn parent(&self) -> Self {
        self.traverse(Axis::Parent, None)
    }

    /// Move the set along `axis`. `until` bounds the `*Until` axes and is
    /// exclusive; an invalid `until` selector never matches.
    pub fn traverse(&self, axis: Axis, until: Option<&str>) -> Self {
        let stop = until.and_then(|s| Selector::parse(s).ok());
        let stops_at = |node: &NodeRef<'_, Node>| match (&stop, ElementRef::wrap(*node)) {
            (Some(selector), Some(el)) => selector.matches(&el),
            _ => false,
        };

        match axis {
            Axis::Next => self.collect(|node| {
                node.next_siblings().find(|n| n.value().is_element()).into_iter()
            }),
            Axis::Prev => self.collect(|node| {
                node.prev_siblings().find(|n| n.value().is_element()).into_iter()
            }),
            Axis::NextAll => self.collect(|node| node.next_siblings()),
            Axis::PrevAll => self.collect(|node| node.prev_siblings()),
            Axis::NextUntil => self.collect(|node| {
                node.next_siblings()
                    .filter(|n| n.value().is_element())
                    .take_while(|n| !stops_at(n))
                    .collect::<Vec<_>>()
                    .into_iter()
            }),
            Axis::PrevUntil => self.collect(|node| {
                node.prev_siblings()
                    .filter(|n| n.value().is_element())
                    .take_while(|n| !stops_at(n))
                    .collect::<Vec<_>>()
                    .into_iter()
            }),
            Axis::Siblings => self.collect(|node| {
                let id = node.id();
                node.parent()
                    .into_iter()
                    .flat_map(|parent| parent.children())
                    .filter(move |n| n.id() != id)
            }),
            Axis::Children => self.collect(|node| node.children()),
            Axis::Parent => self.collect(|node| node.parent().into_iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<html><head><title>Shop</title></head><body>
        <ul id="items">
            <li class="item sale" data-id="1">One</li>
            <li class="item">Two</li>
            <li class="item sale" data-id="3">Three</li>
            <li class="end">End</li>
        </ul>
        <a href="/p2">go</a>
    </body></html>"#;

    fn texts(doc: &QueryDocument) -> Vec<String> {
        (0..doc.len() as i64).map(|i| doc.get(i).text()).collect()
    }

    #[test]
    fn test_find_text_and_attr() {
        let doc = QueryDocument::parse(r#"<div id="x">hi</div>"#);
        assert_eq!(doc.find("#x").text(), "hi");
        assert_eq!(doc.find("#x").attr("id"), "x");
        assert_eq!(doc.find("#x").attr("missing"), "");
        assert!(doc.find("#x").has_attr("id"));
        assert!(!doc.find("#x").has_attr("class"));
        assert_eq!(doc.find("#x").name(), "div");
    }

    #[test]
    fn test_find_preserves_document_order() {
        let doc = QueryDocument::parse(PAGE);
        let items = doc.find("li.item");
        assert_eq!(items.len(), 3);
        assert_eq!(texts(&items), vec!["One", "Two", "Three"]);
        assert_eq!(items.first().text(), "One");
        assert_eq!(items.last().text(), "Three");
        assert_eq!(items.get(-2).text(), "Two");
    }

    #[test]
    fn test_out_of_range_and_invalid_selector_are_empty() {
        let doc = QueryDocument::parse(PAGE);
        let items = doc.find("li");
        assert!(items.get(10).is_empty());
        assert_eq!(items.get(10).text(), "");
        assert_eq!(items.get(10).html(), "");
        assert!(doc.find("li[[").is_empty());
        assert!(doc.find(".nope").first().attr("href").is_empty());
    }

    #[test]
    fn test_has_class_checks_any_node() {
        let doc = QueryDocument::parse(PAGE);
        assert!(doc.find("li").has_class("sale"));
        assert!(!doc.find("li.end").has_class("sale"));
    }

    #[test]
    fn test_html_is_outer_markup_of_first_node() {
        let doc = QueryDocument::parse(PAGE);
        assert_eq!(doc.find("a").html(), r#"<a href="/p2">go</a>"#);
        assert!(doc.html().contains("<title>Shop</title>"));
    }

    #[test]
    fn test_sibling_traversal() {
        let doc = QueryDocument::parse(PAGE);
        let first = doc.find("li").first();

        assert_eq!(first.next().text(), "Two");
        assert_eq!(texts(&first.next_all()), vec!["Two", "Three", "End"]);
        assert_eq!(texts(&first.next_until(".end")), vec!["Two", "Three"]);
        assert_eq!(texts(&first.siblings()), vec!["Two", "Three", "End"]);

        let end = doc.find(".end");
        assert_eq!(end.prev().text(), "Three");
        assert_eq!(texts(&end.prev_all()), vec!["Three", "Two", "One"]);
        assert_eq!(texts(&end.prev_until("[data-id='1']")), vec!["Three", "Two"]);
    }

    #[test]
    fn test_parent_and_children() {
        let doc = QueryDocument::parse(PAGE);
        let items = doc.find("li");
        let parent = items.parent();
        assert_eq!(parent.len(), 1);
        assert_eq!(parent.attr("id"), "items");
        assert_eq!(parent.children().len(), 4);
        assert!(doc.find("html").parent().is_empty());
    }

    #[test]
    fn test_axis_names() {
        assert_eq!("nextUntil".parse::<Axis>().unwrap(), Axis::NextUntil);
        assert!("sideways".parse::<Axis>().is_err());
    }
}
