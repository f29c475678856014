//! Minimal XML document model for SAML processing.
//!
//! Inbound protocol messages arrive as arbitrary XML from the peer; they
//! are parsed into this owned tree once and every later stage (message
//! readers, signature verification, canonicalization, decryption) works
//! on the tree instead of re-scanning bytes. Outbound messages are
//! written by hand and round-tripped through the same parser before
//! signing, so signer and verifier always agree on the document shape.
//!
//! DOCTYPE declarations are rejected outright; external entities have no
//! business inside a protocol message.

pub mod c14n;

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

/// XML namespace URIs used throughout the engine.
pub mod ns {
    pub const SAMLP: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
    pub const SAML: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
    pub const DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const XENC: &str = "http://www.w3.org/2001/04/xmlenc#";
    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
    pub const SOAP_ENV: &str = "http://schemas.xmlsoap.org/soap/envelope/";
}

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("DOCTYPE declarations are not accepted")]
    DoctypeRejected,

    #[error("unbound namespace prefix `{0}`")]
    UnboundPrefix(String),

    #[error("document has no root element")]
    NoRoot,
}

/// A namespace declaration (`xmlns` or `xmlns:prefix`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsDecl {
    /// `None` for the default namespace.
    pub prefix: Option<String>,
    pub uri: String,
}

/// A non-namespace attribute, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub prefix: Option<String>,
    pub local: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// One element with its namespace context resolved at parse time.
#[derive(Debug, Clone)]
pub struct Element {
    pub prefix: Option<String>,
    pub local: String,
    /// Resolved namespace URI of this element.
    pub ns: Option<String>,
    /// Declarations written on this element, in document order.
    pub ns_decls: Vec<NsDecl>,
    /// Attributes in document order.
    pub attrs: Vec<Attr>,
    pub children: Vec<Node>,
}

impl Element {
    /// Bare element for building documents programmatically.
    pub fn new(prefix: Option<&str>, local: &str, ns: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(str::to_owned),
            local: local.to_owned(),
            ns: ns.map(str::to_owned),
            ns_decls: Vec::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is(&self, ns_uri: &str, local: &str) -> bool {
        self.local == local && self.ns.as_deref() == Some(ns_uri)
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given namespace and local name.
    pub fn child(&self, ns_uri: &str, local: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.is(ns_uri, local))
    }

    pub fn children_named<'a>(
        &'a self,
        ns_uri: &'a str,
        local: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.child_elements().filter(move |el| el.is(ns_uri, local))
    }

    /// Attribute value by local name, ignoring any prefix.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.local == local)
            .map(|a| a.value.as_str())
    }

    /// Concatenated direct text content, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out.trim().to_owned()
    }

    /// Qualified name as written.
    pub fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{}", self.local),
            None => self.local.clone(),
        }
    }

    /// Depth-first search for a descendant (or self) matching the
    /// predicate; the returned clone has every inherited namespace
    /// declaration merged onto it so it can be canonicalized standalone.
    pub fn find_with_scope(&self, pred: &dyn Fn(&Element) -> bool) -> Option<Element> {
        fn walk(
            el: &Element,
            scope: &HashMap<Option<String>, String>,
            pred: &dyn Fn(&Element) -> bool,
        ) -> Option<Element> {
            let mut scope = scope.clone();
            for decl in &el.ns_decls {
                scope.insert(decl.prefix.clone(), decl.uri.clone());
            }
            if pred(el) {
                return Some(with_merged_scope(el, &scope));
            }
            for child in el.child_elements() {
                if let Some(found) = walk(child, &scope, pred) {
                    return Some(found);
                }
            }
            None
        }
        walk(self, &HashMap::new(), pred)
    }
}

/// Clone `el` with the full in-scope namespace set written onto its own
/// declaration list. Exclusive canonicalization only renders utilized
/// declarations, so over-declaring here is harmless.
fn with_merged_scope(el: &Element, scope: &HashMap<Option<String>, String>) -> Element {
    let mut clone = el.clone();
    for (prefix, uri) in scope {
        if !clone.ns_decls.iter().any(|d| &d.prefix == prefix) {
            clone.ns_decls.push(NsDecl {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
    }
    clone
}

/// Parse a document into its root element.
pub fn parse_document(xml: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut scopes: Vec<Vec<NsDecl>> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let el = open_element(start.name().as_ref(), start.attributes(), &scopes)?;
                scopes.push(el.ns_decls.clone());
                stack.push(el);
            }
            Ok(Event::Empty(start)) => {
                let el = open_element(start.name().as_ref(), start.attributes(), &scopes)?;
                attach(el, &mut stack, &mut root)?;
            }
            Ok(Event::End(_)) => {
                scopes.pop();
                let el = stack.pop().ok_or_else(|| {
                    XmlError::Malformed("closing tag without opening tag".into())
                })?;
                attach(el, &mut stack, &mut root)?;
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| XmlError::Malformed(e.to_string()))?
                    .into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(value));
                }
            }
            Ok(Event::CData(cdata)) => {
                let value = String::from_utf8(cdata.into_inner().into_owned())
                    .map_err(|e| XmlError::Malformed(e.to_string()))?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(value));
                }
            }
            Ok(Event::DocType(_)) => return Err(XmlError::DoctypeRejected),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Malformed("unclosed element".into()));
    }
    root.ok_or(XmlError::NoRoot)
}

fn attach(
    el: Element,
    stack: &mut Vec<Element>,
    root: &mut Option<Element>,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(XmlError::Malformed(
            "multiple root elements in document".into(),
        )),
    }
}

fn open_element(
    name: &[u8],
    attributes: quick_xml::events::attributes::Attributes<'_>,
    scopes: &[Vec<NsDecl>],
) -> Result<Element, XmlError> {
    let (prefix, local) = split_qname(name)?;

    let mut ns_decls = Vec::new();
    let mut attrs = Vec::new();
    for attribute in attributes {
        let attribute = attribute.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = attribute.key.as_ref().to_vec();
        let value = attribute
            .unescape_value()
            .map_err(|e| XmlError::Malformed(e.to_string()))?
            .into_owned();

        if key == b"xmlns" {
            ns_decls.push(NsDecl { prefix: None, uri: value });
        } else if let Some(rest) = key.strip_prefix(b"xmlns:") {
            let decl_prefix = utf8(rest)?;
            ns_decls.push(NsDecl {
                prefix: Some(decl_prefix),
                uri: value,
            });
        } else {
            let (attr_prefix, attr_local) = split_qname(&key)?;
            attrs.push(Attr {
                prefix: attr_prefix,
                local: attr_local,
                value,
            });
        }
    }

    let ns = resolve_prefix(prefix.as_deref(), &ns_decls, scopes);
    if ns.is_none() && prefix.is_some() {
        return Err(XmlError::UnboundPrefix(prefix.unwrap_or_default()));
    }

    Ok(Element {
        prefix,
        local,
        ns,
        ns_decls,
        attrs,
        children: Vec::new(),
    })
}

fn resolve_prefix(
    prefix: Option<&str>,
    own_decls: &[NsDecl],
    scopes: &[Vec<NsDecl>],
) -> Option<String> {
    let lookup = |decls: &[NsDecl]| {
        decls
            .iter()
            .rev()
            .find(|d| d.prefix.as_deref() == prefix)
            .map(|d| d.uri.clone())
    };
    if let Some(uri) = lookup(own_decls) {
        return non_empty(uri);
    }
    for decls in scopes.iter().rev() {
        if let Some(uri) = lookup(decls) {
            return non_empty(uri);
        }
    }
    None
}

fn non_empty(uri: String) -> Option<String> {
    if uri.is_empty() { None } else { Some(uri) }
}

fn split_qname(name: &[u8]) -> Result<(Option<String>, String), XmlError> {
    match name.iter().position(|&b| b == b':') {
        Some(idx) => Ok((Some(utf8(&name[..idx])?), utf8(&name[idx + 1..])?)),
        None => Ok((None, utf8(name)?)),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, XmlError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| XmlError::Malformed(e.to_string()))
}

/// Serialize an element tree back to XML.
///
/// Prefixes, declarations, and attribute order are emitted exactly as
/// stored; the result re-parses to an identical tree.
pub fn serialize(el: &Element) -> String {
    let mut out = String::new();
    write_element(el, &mut out);
    out
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.qname());
    for decl in &el.ns_decls {
        match &decl.prefix {
            Some(p) => out.push_str(&format!(r#" xmlns:{p}="{}""#, escape_attr(&decl.uri))),
            None => out.push_str(&format!(r#" xmlns="{}""#, escape_attr(&decl.uri))),
        }
    }
    for attr in &el.attrs {
        let name = match &attr.prefix {
            Some(p) => format!("{p}:{}", attr.local),
            None => attr.local.clone(),
        };
        out.push_str(&format!(r#" {name}="{}""#, escape_attr(&attr.value)));
    }
    out.push('>');
    for child in &el.children {
        match child {
            Node::Element(child_el) => write_element(child_el, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
        }
    }
    out.push_str("</");
    out.push_str(&el.qname());
    out.push('>');
}

/// Escape a string for use inside element text.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape a string for use inside a double-quoted attribute value.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_namespaces() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1">
            <saml:Issuer>https://idp.example.com</saml:Issuer>
        </samlp:Response>"#;
        let root = parse_document(xml).unwrap();
        assert!(root.is(ns::SAMLP, "Response"));
        assert_eq!(root.attr("ID"), Some("_r1"));
        let issuer = root.child(ns::SAML, "Issuer").unwrap();
        assert_eq!(issuer.text(), "https://idp.example.com");
    }

    #[test]
    fn parse_rejects_doctype() {
        let xml = r#"<!DOCTYPE foo [<!ENTITY bar "baz">]><foo>&bar;</foo>"#;
        assert!(matches!(
            parse_document(xml),
            Err(XmlError::DoctypeRejected)
        ));
    }

    #[test]
    fn parse_rejects_unbound_prefix() {
        let xml = "<a:Root>x</a:Root>";
        assert!(matches!(parse_document(xml), Err(XmlError::UnboundPrefix(_))));
    }

    #[test]
    fn serialize_round_trips() {
        let xml = r#"<p:Outer xmlns:p="urn:x" attr="v&amp;v"><p:Inner>text &lt; more</p:Inner><Plain/></p:Outer>"#;
        let root = parse_document(xml).unwrap();
        let serialized = serialize(&root);
        let reparsed = parse_document(&serialized).unwrap();
        assert!(reparsed.is("urn:x", "Outer"));
        assert_eq!(reparsed.attr("attr"), Some("v&v"));
        assert_eq!(
            reparsed.child("urn:x", "Inner").unwrap().text(),
            "text < more"
        );
        // A second round trip is byte-stable.
        assert_eq!(serialize(&reparsed), serialized);
    }

    #[test]
    fn find_with_scope_merges_inherited_declarations() {
        let xml = r#"<a xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><b><ds:SignedInfo ID="si"/></b></a>"#;
        let root = parse_document(xml).unwrap();
        let found = root
            .find_with_scope(&|el| el.attr("ID") == Some("si"))
            .unwrap();
        assert!(
            found
                .ns_decls
                .iter()
                .any(|d| d.prefix.as_deref() == Some("ds") && d.uri == ns::DSIG)
        );
    }

    #[test]
    fn default_namespace_applies_to_unprefixed_children() {
        let xml = r#"<Root xmlns="urn:d"><Child>v</Child></Root>"#;
        let root = parse_document(xml).unwrap();
        assert!(root.is("urn:d", "Root"));
        assert!(root.child("urn:d", "Child").is_some());
    }
}
