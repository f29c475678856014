//! Exclusive XML canonicalization (xml-exc-c14n, without comments).
//!
//! Both digest computation and SignedInfo signing operate on the
//! canonical byte form, so signer and verifier agree regardless of how
//! the document was pretty-printed or which ancestor declared a prefix.
//! Only the subset of the W3C recommendation exercised by SAML documents
//! is implemented: namespace nodes are rendered where visibly utilized,
//! attributes are sorted by (namespace URI, local name), and the
//! InclusiveNamespaces PrefixList is honored.

use std::collections::{BTreeSet, HashMap};

use super::{Element, Node, XmlError};

/// Canonicalize an element subtree.
///
/// The element must carry every namespace declaration its subtree needs
/// (either because it is a document root or because it was extracted via
/// [`Element::find_with_scope`]).
pub fn canonicalize(el: &Element, inclusive_prefixes: &[String]) -> Result<String, XmlError> {
    let mut out = String::new();
    render(el, &HashMap::new(), &HashMap::new(), inclusive_prefixes, &mut out)?;
    Ok(out)
}

type Scope = HashMap<Option<String>, String>;

fn render(
    el: &Element,
    inherited_scope: &Scope,
    rendered: &Scope,
    inclusive: &[String],
    out: &mut String,
) -> Result<(), XmlError> {
    let mut scope = inherited_scope.clone();
    for decl in &el.ns_decls {
        if decl.uri.is_empty() {
            scope.remove(&decl.prefix);
        } else {
            scope.insert(decl.prefix.clone(), decl.uri.clone());
        }
    }

    // Visibly utilized prefixes: the element's own, its attributes', and
    // whatever the signature's PrefixList asks to treat inclusively.
    let mut utilized: BTreeSet<Option<String>> = BTreeSet::new();
    utilized.insert(el.prefix.clone());
    for attr in &el.attrs {
        if let Some(prefix) = &attr.prefix {
            utilized.insert(Some(prefix.clone()));
        }
    }
    for prefix in inclusive {
        if prefix == "#default" {
            utilized.insert(None);
        } else {
            utilized.insert(Some(prefix.clone()));
        }
    }

    let mut to_render: Vec<(Option<String>, String)> = Vec::new();
    for prefix in &utilized {
        match (scope.get(prefix), rendered.get(prefix)) {
            (Some(uri), previous) if previous != Some(uri) => {
                to_render.push((prefix.clone(), uri.clone()));
            }
            // The default namespace went out of scope under an ancestor
            // that rendered one: emit the un-declaration.
            (None, Some(_)) if prefix.is_none() => to_render.push((None, String::new())),
            (None, None) if prefix.is_some() && prefix.as_deref() == el.prefix.as_deref() => {
                return Err(XmlError::UnboundPrefix(prefix.clone().unwrap_or_default()));
            }
            _ => {}
        }
    }

    out.push('<');
    out.push_str(&el.qname());

    for (prefix, uri) in &to_render {
        match prefix {
            Some(p) => {
                out.push_str(" xmlns:");
                out.push_str(p);
            }
            None => out.push_str(" xmlns"),
        }
        out.push_str("=\"");
        out.push_str(&escape_attr_c14n(uri));
        out.push('"');
    }

    let mut attrs = el.attrs.clone();
    attrs.sort_by(|a, b| {
        let a_ns = a
            .prefix
            .as_ref()
            .and_then(|p| scope.get(&Some(p.clone())))
            .cloned()
            .unwrap_or_default();
        let b_ns = b
            .prefix
            .as_ref()
            .and_then(|p| scope.get(&Some(p.clone())))
            .cloned()
            .unwrap_or_default();
        (a_ns, &a.local).cmp(&(b_ns, &b.local))
    });
    for attr in &attrs {
        out.push(' ');
        if let Some(prefix) = &attr.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&attr.local);
        out.push_str("=\"");
        out.push_str(&escape_attr_c14n(&attr.value));
        out.push('"');
    }
    out.push('>');

    let mut child_rendered = rendered.clone();
    for (prefix, uri) in &to_render {
        if uri.is_empty() {
            child_rendered.remove(prefix);
        } else {
            child_rendered.insert(prefix.clone(), uri.clone());
        }
    }

    for child in &el.children {
        match child {
            Node::Element(child_el) => {
                render(child_el, &scope, &child_rendered, inclusive, out)?;
            }
            Node::Text(text) => out.push_str(&escape_text_c14n(text)),
        }
    }

    out.push_str("</");
    out.push_str(&el.qname());
    out.push('>');
    Ok(())
}

fn escape_text_c14n(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr_c14n(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}
