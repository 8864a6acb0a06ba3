//! Minimal element tree used for envelopes, ID cards and caller payloads.
//!
//! Names are kept exactly as written (`prefix:local`). Lookups match on the local
//! part, so the client does not depend on the prefixes a remote service picks.
//! Parsing rejects document type declarations.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::fmt;

use crate::errors::{Error, Result};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Sets an attribute, replacing an existing one with the same qualified name.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Attribute value by local name, ignoring namespace declarations.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|(key, _)| !is_namespace_decl(key))
            .find(|(key, _)| local_part(key) == local)
            .map(|(_, value)| value.as_str())
    }

    /// The `id` (or `wsu:Id`) attribute.
    pub fn id(&self) -> Option<&str> {
        self.attr("id").or_else(|| self.attr("Id"))
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn first_element(&self) -> Option<&Element> {
        self.elements().next()
    }

    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|el| el.local_name() == local)
    }

    pub fn child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(el) if el.local_name() == local => Some(el),
            _ => None,
        })
    }

    pub fn children_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |el| el.local_name() == local)
    }

    /// Follows a path of child local names.
    pub fn path(&self, locals: &[&str]) -> Option<&Element> {
        locals
            .iter()
            .try_fold(self, |current, local| current.child(local))
    }

    /// Depth-first search including `self`.
    pub fn find(&self, local: &str) -> Option<&Element> {
        if self.local_name() == local {
            return Some(self);
        }
        self.elements().find_map(|child| child.find(local))
    }

    /// Depth-first search for the element carrying `id`.
    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        if self.id() == Some(id) {
            return Some(self);
        }
        self.elements().find_map(|child| child.find_by_id(id))
    }

    /// Concatenated text of direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Trimmed text of a child element, if present.
    pub fn child_text(&self, local: &str) -> Option<String> {
        self.child(local).map(|el| el.text().trim().to_string())
    }

    /// Namespace declarations on this element as `(prefix, uri)`; the default
    /// namespace uses the empty prefix.
    pub fn namespace_decls(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(key, value)| {
            if key == "xmlns" {
                Some(("", value.as_str()))
            } else {
                key.strip_prefix("xmlns:")
                    .map(|prefix| (prefix, value.as_str()))
            }
        })
    }

    /// Finds the first descendant named `local` and returns a copy that declares every
    /// namespace prefix it uses but inherited from an ancestor.
    pub fn extract(&self, local: &str) -> Option<Element> {
        let mut scope = Vec::new();
        self.extract_in_scope(local, &mut scope)
    }

    /// Follows `locals` like [`Element::path`] and returns a namespace-complete copy of
    /// the element it reaches.
    pub fn extract_path(&self, locals: &[&str]) -> Option<Element> {
        self.extract_path_in(locals, Vec::new())
    }

    fn extract_path_in(&self, locals: &[&str], mut scope: Vec<(String, String)>) -> Option<Element> {
        scope.extend(
            self.namespace_decls()
                .map(|(prefix, uri)| (prefix.to_string(), uri.to_string())),
        );
        match locals.split_first() {
            None => Some(self.with_inherited_namespaces(&scope)),
            Some((local, rest)) => self.child(local)?.extract_path_in(rest, scope),
        }
    }

    fn extract_in_scope(&self, local: &str, scope: &mut Vec<(String, String)>) -> Option<Element> {
        let depth = scope.len();
        scope.extend(
            self.namespace_decls()
                .map(|(prefix, uri)| (prefix.to_string(), uri.to_string())),
        );
        let found = if self.local_name() == local {
            Some(self.with_inherited_namespaces(scope))
        } else {
            self.elements()
                .find_map(|child| child.extract_in_scope(local, scope))
        };
        scope.truncate(depth);
        found
    }

    fn with_inherited_namespaces(&self, scope: &[(String, String)]) -> Element {
        let mut missing = Vec::new();
        self.collect_undeclared(&mut Vec::new(), &mut missing);
        let mut out = self.clone();
        for prefix in missing {
            if let Some((_, uri)) = scope.iter().rev().find(|(p, _)| *p == prefix) {
                let key = if prefix.is_empty() {
                    "xmlns".to_string()
                } else {
                    format!("xmlns:{prefix}")
                };
                out.attributes.push((key, uri.clone()));
            }
        }
        out
    }

    fn collect_undeclared(&self, declared: &mut Vec<String>, missing: &mut Vec<String>) {
        let depth = declared.len();
        declared.extend(self.namespace_decls().map(|(prefix, _)| prefix.to_string()));

        let mut used = vec![self.prefix().unwrap_or("").to_string()];
        used.extend(
            self.attributes
                .iter()
                .filter(|(key, _)| !is_namespace_decl(key))
                .filter_map(|(key, _)| key.split_once(':').map(|(p, _)| p.to_string())),
        );
        for prefix in used {
            if prefix == "xml" || declared.contains(&prefix) || missing.contains(&prefix) {
                continue;
            }
            missing.push(prefix);
        }
        for child in self.elements() {
            child.collect_undeclared(declared, missing);
        }
        declared.truncate(depth);
    }

    /// Removes direct children matching `predicate`.
    pub fn remove_children<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&Element) -> bool,
    {
        self.children.retain(|node| match node {
            Node::Element(el) => !predicate(el),
            Node::Text(_) => true,
        });
    }

    /// Parses a document and returns its root element.
    pub fn parse(text: &str) -> Result<Element> {
        parse_document(text)
    }

    /// Serializes without an XML declaration.
    pub fn to_xml(&self) -> String {
        String::from_utf8(self.write_bytes(&WriteOptions::default())).unwrap_or_default()
    }

    /// Serializes with an XML declaration, as sent on the wire.
    pub fn to_document(&self) -> String {
        format!("{XML_DECLARATION}{}", self.to_xml())
    }

    /// Bytes covered by signature digests: namespace declarations and direct
    /// `Signature` children are left out.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut trimmed = self.clone();
        trimmed.remove_children(|el| el.local_name() == "Signature");
        trimmed.write_bytes(&WriteOptions {
            skip_namespace_decls: true,
        })
    }

    fn write_bytes(&self, options: &WriteOptions) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self, options);
        writer.into_inner()
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[derive(Default)]
struct WriteOptions {
    skip_namespace_decls: bool,
}

// Writing into a Vec cannot fail, so write results are ignored.
fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element, options: &WriteOptions) {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        if options.skip_namespace_decls && is_namespace_decl(key) {
            continue;
        }
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        let _ = writer.write_event(Event::Empty(start));
        return;
    }
    let _ = writer.write_event(Event::Start(start));
    for child in &element.children {
        match child {
            Node::Element(el) => write_element(writer, el, options),
            Node::Text(text) => {
                let _ = writer.write_event(Event::Text(BytesText::new(text)));
            }
        }
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(element.name.as_str())));
}

fn parse_document(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| Error::Xml(format!("at byte {}: {err}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => {
                stack.push(start_element(&start)?);
            }
            Event::Empty(start) => {
                let element = start_element(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::Xml("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|err| Error::Xml(err.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::CData(data) => {
                let value = String::from_utf8(data.into_inner().into_owned())
                    .map_err(|err| Error::Xml(err.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::DocType(_) => {
                return Err(Error::Xml("document type declarations are not accepted".into()));
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(Error::Xml("unexpected end of document".into()));
    }
    root.ok_or_else(|| Error::Xml("document has no root element".into()))
}

fn start_element(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .map_err(|err| Error::Xml(err.to_string()))?;
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| Error::Xml(err.to_string()))?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .map_err(|err| Error::Xml(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| Error::Xml(err.to_string()))?;
        element.attributes.push((key, value.into_owned()));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(Error::Xml("document has more than one root element".into())),
    }
}

fn push_text(stack: &mut [Element], value: &str) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            match parent.children.last_mut() {
                Some(Node::Text(existing)) => existing.push_str(value),
                _ => parent.children.push(Node::Text(value.to_string())),
            }
            Ok(())
        }
        None if value.trim().is_empty() => Ok(()),
        None => Err(Error::Xml("text outside the root element".into())),
    }
}

fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name)
}

fn is_namespace_decl(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}
