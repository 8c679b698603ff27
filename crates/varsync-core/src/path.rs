//! Variable path syntax.
//!
//! A path is a dot-separated list of segments navigated from a variable's
//! parent value: `name`, `father.name`, `@customers.2.name`, `getName()`,
//! `..name`. Anything after `?` is kept as URL-style parameters and does not
//! take part in navigation.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Property(String),
    /// 1-based array index.
    Index(usize),
    Method(String),
    Parent,
    /// `@name`, only recognized as the first segment.
    Standard(String),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(name) => f.write_str(name),
            Self::Index(i) => write!(f, "{i}"),
            Self::Method(name) => write!(f, "{name}()"),
            Self::Parent => f.write_str(".."),
            Self::Standard(name) => write!(f, "@{name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Path {
    segments: Vec<Segment>,
    params: Vec<(String, String)>,
    raw: String,
}

impl Path {
    pub fn parse(raw: &str) -> Self {
        let (body, query) = match raw.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (raw, None),
        };

        let mut segments = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("..") {
                segments.push(Segment::Parent);
                rest = after.strip_prefix('.').unwrap_or(after);
                continue;
            }
            let (part, after) = rest.split_once('.').unwrap_or((rest, ""));
            rest = after;
            if part.is_empty() {
                continue;
            }
            segments.push(classify(part, segments.is_empty()));
        }

        Self {
            segments,
            params: query.map(parse_query).unwrap_or_default(),
            raw: raw.to_string(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The `@name` this path starts from, if any.
    pub fn standard_name(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Standard(name)) => Some(name),
            _ => None,
        }
    }

    /// Number of leading `..` segments.
    pub fn parent_depth(&self) -> usize {
        self.segments
            .iter()
            .take_while(|s| matches!(s, Segment::Parent))
            .count()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn classify(part: &str, first: bool) -> Segment {
    if first {
        if let Some(name) = part.strip_prefix('@') {
            if is_identifier(name) {
                return Segment::Standard(name.to_string());
            }
        }
    }
    if let Some(name) = part.strip_suffix("()") {
        if is_identifier(name) {
            return Segment::Method(name.to_string());
        }
    }
    if is_index(part) {
        if let Ok(index) = part.parse::<usize>() {
            return Segment::Index(index);
        }
    }
    Segment::Property(part.to_string())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_index(s: &str) -> bool {
    s.starts_with(|c: char| ('1'..='9').contains(&c)) && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(s: &str) -> Segment {
        Segment::Property(s.to_string())
    }

    #[test]
    fn empty_path_has_no_segments() {
        let p = Path::parse("");
        assert!(p.is_empty());
        assert_eq!(p.as_str(), "");
    }

    #[test]
    fn property_chain() {
        let p = Path::parse("father.name");
        assert_eq!(p.segments(), &[prop("father"), prop("name")]);
    }

    #[test]
    fn standard_index_and_property() {
        let p = Path::parse("@customers.2.name");
        assert_eq!(
            p.segments(),
            &[Segment::Standard("customers".into()), Segment::Index(2), prop("name")]
        );
        assert_eq!(p.standard_name(), Some("customers"));
    }

    #[test]
    fn standard_only_recognized_first() {
        let p = Path::parse("a.@b");
        assert_eq!(p.segments(), &[prop("a"), prop("@b")]);
        assert_eq!(p.standard_name(), None);
    }

    #[test]
    fn method_call() {
        let p = Path::parse("person.getName()");
        assert_eq!(p.segments(), &[prop("person"), Segment::Method("getName".into())]);
    }

    #[test]
    fn zero_and_leading_zero_are_properties() {
        let p = Path::parse("items.0.01");
        assert_eq!(p.segments(), &[prop("items"), prop("0"), prop("01")]);
    }

    #[test]
    fn leading_parent_traversal() {
        let p = Path::parse("..name");
        assert_eq!(p.segments(), &[Segment::Parent, prop("name")]);
        assert_eq!(p.parent_depth(), 1);

        let p = Path::parse("....name");
        assert_eq!(p.parent_depth(), 2);

        let p = Path::parse("..");
        assert_eq!(p.segments(), &[Segment::Parent]);
    }

    #[test]
    fn url_params_are_split_off() {
        let p = Path::parse("contacts?create=Contact&label=New%20one");
        assert_eq!(p.segments(), &[prop("contacts")]);
        assert_eq!(p.param("create"), Some("Contact"));
        assert_eq!(p.param("label"), Some("New one"));
        assert_eq!(p.param("missing"), None);
        assert_eq!(p.to_string(), "contacts?create=Contact&label=New%20one");
    }
}
