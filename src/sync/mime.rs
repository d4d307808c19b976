//! MIME tree and plain-text body extraction.
//!
//! The provider's nested payload is converted into a [`MimePart`] tree once,
//! at the API boundary. Extraction is then a pure recursive walk:
//!
//! - `multipart/alternative`: the `text/plain` child wins, then `text/html`.
//!   With neither present it is treated like any other multipart.
//! - other multiparts: the first child that yields non-empty text.
//! - `text/plain` leaf: base64url-decoded as-is.
//! - `text/html` leaf: decoded, then reduced to whitespace-joined text.
//! - anything else: empty.

use base64::Engine;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;

use crate::error::DecodeError;

/// URL-safe alphabet, padding optional. Provider bodies arrive both ways.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Content type of a leaf part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafKind {
    Plain,
    Html,
    /// Attachments, calendar invites and other non-body content.
    Other(String),
}

/// Subtype of a multipart container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartKind {
    Alternative,
    Mixed,
    Related,
    Other(String),
}

/// An explicit MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePart {
    Leaf {
        kind: LeafKind,
        /// base64url body data, absent for empty or externally stored parts.
        data: Option<String>,
    },
    Multipart {
        kind: MultipartKind,
        parts: Vec<MimePart>,
    },
}

impl MimePart {
    /// Build a node from a raw `type/subtype` string (parameters ignored).
    pub fn from_mime_type(mime_type: &str, data: Option<String>, parts: Vec<MimePart>) -> Self {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if let Some(subtype) = essence.strip_prefix("multipart/") {
            let kind = match subtype {
                "alternative" => MultipartKind::Alternative,
                "mixed" => MultipartKind::Mixed,
                "related" => MultipartKind::Related,
                other => MultipartKind::Other(other.to_string()),
            };
            return Self::Multipart { kind, parts };
        }

        let kind = match essence.as_str() {
            "text/plain" => LeafKind::Plain,
            "text/html" => LeafKind::Html,
            _ => LeafKind::Other(essence),
        };
        Self::Leaf { kind, data }
    }

    pub fn plain(data: impl Into<String>) -> Self {
        Self::Leaf {
            kind: LeafKind::Plain,
            data: Some(data.into()),
        }
    }

    pub fn html(data: impl Into<String>) -> Self {
        Self::Leaf {
            kind: LeafKind::Html,
            data: Some(data.into()),
        }
    }

    fn is_leaf(&self, want: &LeafKind) -> bool {
        matches!(self, Self::Leaf { kind, .. } if kind == want)
    }
}

/// Extract the human-readable body of a message.
///
/// A decode failure anywhere on the chosen path fails the whole message.
pub fn extract_body(part: &MimePart) -> Result<String, DecodeError> {
    match part {
        MimePart::Multipart {
            kind: MultipartKind::Alternative,
            parts,
        } => {
            let preferred = parts
                .iter()
                .find(|p| p.is_leaf(&LeafKind::Plain))
                .or_else(|| parts.iter().find(|p| p.is_leaf(&LeafKind::Html)));
            match preferred {
                Some(p) => extract_body(p),
                None => first_non_empty(parts),
            }
        }
        MimePart::Multipart { parts, .. } => first_non_empty(parts),
        MimePart::Leaf {
            kind: LeafKind::Plain,
            data: Some(data),
        } => decode_base64url(data),
        MimePart::Leaf {
            kind: LeafKind::Html,
            data: Some(data),
        } => Ok(html_to_text(&decode_base64url(data)?)),
        MimePart::Leaf { .. } => Ok(String::new()),
    }
}

fn first_non_empty(parts: &[MimePart]) -> Result<String, DecodeError> {
    for part in parts {
        let text = extract_body(part)?;
        if !text.is_empty() {
            return Ok(text);
        }
    }
    Ok(String::new())
}

/// Decode base64url body data into UTF-8 text.
///
/// Standard-alphabet characters (`+`, `/`) are accepted too, and missing
/// padding is tolerated.
pub fn decode_base64url(data: &str) -> Result<String, DecodeError> {
    let normalized: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    let bytes = BASE64URL
        .decode(normalized.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| DecodeError::Utf8(e.to_string()))
}

/// Reduce HTML to whitespace-joined text.
///
/// Tags become word breaks, `<script>`/`<style>` bodies are dropped, and
/// common entities are decoded. Not a full HTML parser.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.chars().peekable();
    let mut skip_until: Option<&'static str> = None;

    while let Some(ch) = chars.next() {
        match ch {
            '<' => {
                let mut tag = String::new();
                for c in chars.by_ref() {
                    if c == '>' {
                        break;
                    }
                    tag.push(c);
                }
                let name: String = tag
                    .trim_start()
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '/')
                    .collect::<String>()
                    .to_ascii_lowercase();

                match skip_until {
                    Some(close) if name == close => skip_until = None,
                    Some(_) => {}
                    None => match name.as_str() {
                        "script" => skip_until = Some("/script"),
                        "style" => skip_until = Some("/style"),
                        _ => {}
                    },
                }
                out.push(' ');
            }
            _ if skip_until.is_some() => {}
            '&' => {
                let mut entity = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ';' || entity.len() >= 10 || c.is_whitespace() || c == '&' {
                        break;
                    }
                    entity.push(c);
                    chars.next();
                }
                if chars.peek() == Some(&';') {
                    chars.next();
                    match decode_entity(&entity) {
                        Some(c) => out.push(c),
                        None => {
                            out.push('&');
                            out.push_str(&entity);
                            out.push(';');
                        }
                    }
                } else {
                    out.push('&');
                    out.push_str(&entity);
                }
            }
            _ => out.push(ch),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Named entities common in mail bodies. Everything else stays literal.
const NAMED_ENTITIES: &[(&str, char)] = &[
    ("amp", '&'),
    ("lt", '<'),
    ("gt", '>'),
    ("quot", '"'),
    ("apos", '\''),
    ("nbsp", ' '),
    ("ndash", '\u{2013}'),
    ("mdash", '\u{2014}'),
    ("hellip", '\u{2026}'),
    ("lsquo", '\u{2018}'),
    ("rsquo", '\u{2019}'),
    ("ldquo", '\u{201C}'),
    ("rdquo", '\u{201D}'),
    ("copy", '\u{00A9}'),
    ("reg", '\u{00AE}'),
    ("trade", '\u{2122}'),
    ("euro", '\u{20AC}'),
];

/// Resolve the text between `&` and `;`. `None` leaves it undecoded.
fn decode_entity(entity: &str) -> Option<char> {
    let Some(number) = entity.strip_prefix('#') else {
        return NAMED_ENTITIES
            .iter()
            .find(|(name, _)| *name == entity)
            .map(|(_, c)| *c);
    };
    let codepoint = match number.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => number.parse::<u32>().ok()?,
    };
    char::from_u32(codepoint).filter(|c| *c != '\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn b64(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s)
    }

    #[test]
    fn alternative_prefers_plain() {
        let tree = MimePart::Multipart {
            kind: MultipartKind::Alternative,
            parts: vec![MimePart::html(b64("<p>Hi there</p>")), MimePart::plain(b64("Hello"))],
        };
        assert_eq!(extract_body(&tree).unwrap(), "Hello");
    }

    #[test]
    fn alternative_falls_back_to_html() {
        let tree = MimePart::Multipart {
            kind: MultipartKind::Alternative,
            parts: vec![MimePart::html(b64("<p>Hello</p>"))],
        };
        assert_eq!(extract_body(&tree).unwrap(), "Hello");
    }

    #[test]
    fn mixed_returns_first_non_empty_child() {
        let tree = MimePart::Multipart {
            kind: MultipartKind::Mixed,
            parts: vec![
                MimePart::Leaf {
                    kind: LeafKind::Other("image/png".into()),
                    data: Some(b64("png")),
                },
                MimePart::plain(b64("")),
                MimePart::Multipart {
                    kind: MultipartKind::Alternative,
                    parts: vec![MimePart::plain(b64("nested body"))],
                },
                MimePart::plain(b64("too late")),
            ],
        };
        assert_eq!(extract_body(&tree).unwrap(), "nested body");
    }

    #[test]
    fn alternative_without_text_children_recurses() {
        let tree = MimePart::Multipart {
            kind: MultipartKind::Alternative,
            parts: vec![MimePart::Multipart {
                kind: MultipartKind::Related,
                parts: vec![MimePart::html(b64("<b>inner</b>"))],
            }],
        };
        assert_eq!(extract_body(&tree).unwrap(), "inner");
    }

    #[test]
    fn no_text_part_yields_empty() {
        let tree = MimePart::Leaf {
            kind: LeafKind::Other("application/pdf".into()),
            data: Some(b64("%PDF")),
        };
        assert_eq!(extract_body(&tree).unwrap(), "");
        assert_eq!(
            extract_body(&MimePart::Leaf {
                kind: LeafKind::Plain,
                data: None
            })
            .unwrap(),
            ""
        );
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        let err = extract_body(&MimePart::plain("***")).unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let data = URL_SAFE_NO_PAD.encode([0xff, 0xfe, 0xfd]);
        assert!(matches!(
            decode_base64url(&data),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn decode_accepts_padding_and_standard_alphabet() {
        // "??>" encodes to "Pz8+" in the standard alphabet and "Pz8-" in url-safe.
        assert_eq!(decode_base64url("Pz8-").unwrap(), "??>");
        assert_eq!(decode_base64url("Pz8+").unwrap(), "??>");
        assert_eq!(decode_base64url("SGk=").unwrap(), "Hi");
        assert_eq!(decode_base64url("SGk").unwrap(), "Hi");
    }

    #[test]
    fn mime_type_parsing() {
        assert_eq!(
            MimePart::from_mime_type("text/HTML; charset=utf-8", None, vec![]),
            MimePart::Leaf {
                kind: LeafKind::Html,
                data: None
            }
        );
        assert!(matches!(
            MimePart::from_mime_type("multipart/signed", None, vec![]),
            MimePart::Multipart {
                kind: MultipartKind::Other(_),
                ..
            }
        ));
    }

    #[test]
    fn html_to_text_strips_and_joins() {
        let html = "<html><head><style>p { color: red; }</style></head>\
                    <body><p>Hello&nbsp;<b>world</b></p>\n<script>alert(1)</script>\
                    <div>Fish &amp; chips &#x263A;</div></body></html>";
        assert_eq!(html_to_text(html), "Hello world Fish & chips \u{263A}");
    }

    #[test]
    fn html_to_text_keeps_unknown_entities() {
        assert_eq!(html_to_text("a &bogus; b & c"), "a &bogus; b & c");
    }

    #[test]
    fn typographic_and_numeric_entities() {
        assert_eq!(
            html_to_text("&ldquo;Q3&rdquo; &mdash; &#8364;5&hellip;"),
            "\u{201C}Q3\u{201D} \u{2014} \u{20AC}5\u{2026}"
        );
        // Surrogates, NUL and overflow stay as written.
        assert_eq!(
            html_to_text("&#xD800; &#0; &#99999999999;"),
            "&#xD800; &#0; &#99999999999;"
        );
    }
}
