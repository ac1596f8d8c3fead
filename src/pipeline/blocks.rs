//! Strict parsing of Page Analyzer replies into canonical page blocks.
//!
//! Vision models are asked for a single JSON object but routinely wrap it in
//! prose or fences, emit several objects back to back, or use one of the
//! older reply shapes. Parsing happens in two explicit steps:
//!
//! 1. [`extract_fragments`] scans the region between the outermost JSON
//!    delimiters and returns every top-level JSON value it can parse.
//! 2. [`parse_page_blocks`] validates each fragment against the accepted
//!    shapes and merges them, in order, into one [`PageBlocks`].
//!
//! Accepted fragment shapes:
//!
//! ```text
//! {"headings": [...], "images": [...]}            split object (canonical)
//! {"elements": [{"type": "heading", ...}, ...]}    typed element list
//! [{"type": "image", ...}, {"hierarchy": [...]}]   bare array of items
//! ```
//!
//! Headings carry either `level: int` or `hierarchy: [ancestor, ..., title]`
//! (also `"A > B"`); both normalise to the same [`HeadingBlock`].

use crate::error::{ExtractionError, ExtractionErrorKind};
use crate::pipeline::geometry::NormalizedBox;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A detected heading, normalised to one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadingBlock {
    pub title: String,
    /// 1 = top level.
    pub level: u32,
    /// Ancestor titles, outermost first. Empty when the model reported a
    /// plain level.
    pub path: Vec<String>,
    pub bbox: Option<NormalizedBox>,
}

impl HeadingBlock {
    /// Name stored for the section: the ancestor trail plus the title.
    pub fn label(&self) -> String {
        if self.path.is_empty() {
            self.title.clone()
        } else {
            format!("{} > {}", self.path.join(" > "), self.title)
        }
    }
}

/// A detected diagram or photo region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub description: String,
    /// As reported by the model; clamping happens when it is persisted.
    pub bbox: NormalizedBox,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageBlocks {
    pub headings: Vec<HeadingBlock>,
    pub images: Vec<ImageBlock>,
}

impl PageBlocks {
    pub fn is_empty(&self) -> bool {
        self.headings.is_empty() && self.images.is_empty()
    }

    fn merge(&mut self, other: PageBlocks) {
        self.headings.extend(other.headings);
        self.images.extend(other.images);
    }
}

// ── Step 1: fragment extraction ──────────────────────────────────────────

/// Return every top-level JSON value found between the first opening and
/// the last closing delimiter of `raw`.
///
/// Text between fragments (prose, fences, commas) is skipped. A value that
/// fails to parse is skipped as a whole, up to its matching closing
/// delimiter; values nested inside it are never surfaced. A value that is
/// never closed (a reply cut off at the token limit) ends the scan.
pub fn extract_fragments(raw: &str) -> Result<Vec<Value>, ExtractionError> {
    let start = raw.find(['{', '[']);
    let end = raw.rfind(['}', ']']);
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => {
            return Err(ExtractionError::new(
                ExtractionErrorKind::NoJson,
                format!("no JSON delimiters in {} byte reply", raw.len()),
            ))
        }
    };

    let region = &raw[start..=end];
    let mut fragments = Vec::new();
    let mut pos = 0;

    while pos < region.len() {
        let Some(offset) = region[pos..].find(['{', '[']) else {
            break;
        };
        pos += offset;

        let mut stream = serde_json::Deserializer::from_str(&region[pos..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                pos += stream.byte_offset();
                fragments.push(value);
            }
            _ => match closing_delimiter(&region[pos..]) {
                Some(len) => {
                    debug!("Skipping unparseable {} byte JSON value", len);
                    pos += len;
                }
                None => {
                    debug!("JSON value at byte {} is never closed; reply truncated", pos);
                    break;
                }
            },
        }
    }

    if fragments.is_empty() {
        return Err(ExtractionError::new(
            ExtractionErrorKind::Malformed,
            "delimiters found but no fragment parsed as JSON",
        ));
    }
    Ok(fragments)
}

/// Byte length of the bracketed value opening at the start of `s`, through
/// its matching closer. Delimiters inside strings are ignored. `None` when
/// the value is never closed.
fn closing_delimiter(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in s.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Step 2: shape validation + merge ─────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFragment {
    Elements {
        elements: Vec<Value>,
    },
    Split {
        #[serde(default)]
        headings: Option<Vec<Value>>,
        #[serde(default)]
        images: Option<Vec<Value>>,
    },
    Items(Vec<Value>),
}

/// One block as the model wrote it. Every synonym is its own field so an
/// item carrying both `title` and `description` (or `type` and `kind`)
/// still deserialises.
#[derive(Deserialize)]
struct RawItem {
    #[serde(default, rename = "type")]
    type_tag: Option<Value>,
    #[serde(default)]
    kind: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    level: Option<Value>,
    #[serde(default)]
    hierarchy: Option<Value>,
    #[serde(default)]
    x: Option<Value>,
    #[serde(default)]
    y: Option<Value>,
    #[serde(default)]
    w: Option<Value>,
    #[serde(default)]
    h: Option<Value>,
    #[serde(default)]
    bbox: Option<Value>,
}

impl RawItem {
    fn tag(&self) -> Option<String> {
        [&self.type_tag, &self.kind]
            .into_iter()
            .find_map(|v| non_blank(v.as_ref()))
            .map(|t| t.to_lowercase())
    }

    /// Heading name: `title`, then `text`, then `description`.
    fn heading_text(&self) -> Option<String> {
        [&self.title, &self.text, &self.description]
            .into_iter()
            .find_map(|v| non_blank(v.as_ref()))
    }

    /// Image caption: `description`, then `title`, then `text`.
    fn caption(&self) -> Option<String> {
        [&self.description, &self.title, &self.text]
            .into_iter()
            .find_map(|v| non_blank(v.as_ref()))
    }
}

fn non_blank(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Heading,
    Image,
}

/// Parse a raw model reply into canonical blocks.
///
/// Fails only when no fragment matches an accepted shape; an empty page
/// (`{"headings": [], "images": []}`) is a success.
pub fn parse_page_blocks(raw: &str) -> Result<PageBlocks, ExtractionError> {
    let fragments = extract_fragments(raw)?;
    let total = fragments.len();

    let mut blocks = PageBlocks::default();
    let mut accepted = 0usize;

    for fragment in fragments {
        match normalise_fragment(fragment) {
            Some(part) => {
                accepted += 1;
                blocks.merge(part);
            }
            None => debug!("Ignoring JSON fragment with unrecognised shape"),
        }
    }

    if accepted == 0 {
        return Err(ExtractionError::new(
            ExtractionErrorKind::SchemaMismatch,
            format!("none of {total} JSON fragments had a headings/images/elements shape"),
        ));
    }

    debug!(
        "Parsed {} headings, {} images from {}/{} fragments",
        blocks.headings.len(),
        blocks.images.len(),
        accepted,
        total
    );
    Ok(blocks)
}

fn normalise_fragment(fragment: Value) -> Option<PageBlocks> {
    let raw: RawFragment = serde_json::from_value(fragment).ok()?;
    let mut blocks = PageBlocks::default();

    match raw {
        RawFragment::Split { headings, images } => {
            if headings.is_none() && images.is_none() {
                return None;
            }
            for item in headings.unwrap_or_default() {
                if let Some(h) = parse_item(item).and_then(|i| heading_from(&i)) {
                    blocks.headings.push(h);
                }
            }
            for item in images.unwrap_or_default() {
                if let Some(img) = parse_item(item).and_then(|i| image_from(&i)) {
                    blocks.images.push(img);
                }
            }
        }
        RawFragment::Elements { elements } => {
            collect_typed(elements, &mut blocks);
        }
        RawFragment::Items(items) => {
            // A bare array counts only if it is empty or holds at least one
            // recognisable item; otherwise it is likely an inner array of a
            // truncated object.
            let was_empty = items.is_empty();
            if collect_typed(items, &mut blocks) == 0 && !was_empty {
                return None;
            }
        }
    }

    Some(blocks)
}

/// Sort typed items into `blocks`; returns how many were recognised.
fn collect_typed(items: Vec<Value>, blocks: &mut PageBlocks) -> usize {
    let mut recognised = 0;
    for item in items {
        let Some(item) = parse_item(item) else {
            continue;
        };
        match classify(&item) {
            Some(ItemKind::Heading) => {
                recognised += 1;
                blocks.headings.extend(heading_from(&item));
            }
            Some(ItemKind::Image) => {
                recognised += 1;
                blocks.images.extend(image_from(&item));
            }
            None => {}
        }
    }
    recognised
}

fn parse_item(value: Value) -> Option<RawItem> {
    match serde_json::from_value::<RawItem>(value) {
        Ok(item) => Some(item),
        Err(e) => {
            debug!("Skipping malformed block: {}", e);
            None
        }
    }
}

fn classify(item: &RawItem) -> Option<ItemKind> {
    match item.tag() {
        Some(k) => match k.as_str() {
            "heading" | "title" | "section" | "header" => Some(ItemKind::Heading),
            "image" | "figure" | "diagram" | "photo" | "illustration" => Some(ItemKind::Image),
            _ => None,
        },
        // Untyped items from the hierarchy-style reply are headings.
        None if item.level.is_some() || item.hierarchy.is_some() => Some(ItemKind::Heading),
        None => None,
    }
}

fn heading_from(item: &RawItem) -> Option<HeadingBlock> {
    let mut path = hierarchy_path(item.hierarchy.as_ref());

    let title = match item.heading_text() {
        Some(t) => t,
        None => path.pop()?,
    };
    if path
        .last()
        .is_some_and(|last| last.eq_ignore_ascii_case(&title))
    {
        path.pop();
    }

    let level = item
        .level
        .as_ref()
        .and_then(as_number)
        .map(|l| l.round().max(1.0) as u32)
        .unwrap_or(path.len() as u32 + 1);

    Some(HeadingBlock {
        title,
        level,
        path,
        bbox: geometry(item),
    })
}

fn image_from(item: &RawItem) -> Option<ImageBlock> {
    let Some(bbox) = geometry(item) else {
        debug!("Skipping image block without geometry");
        return None;
    };
    Some(ImageBlock {
        description: item.caption().unwrap_or_default(),
        bbox,
    })
}

fn hierarchy_path(value: Option<&Value>) -> Vec<String> {
    let parts: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .collect(),
        Some(Value::String(s)) => s.split('>').map(|p| p.trim().to_string()).collect(),
        _ => Vec::new(),
    };
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn geometry(item: &RawItem) -> Option<NormalizedBox> {
    if let Some(bbox) = &item.bbox {
        match bbox {
            Value::Object(map) => {
                return Some(NormalizedBox::new(
                    map.get("x").and_then(as_number)?,
                    map.get("y").and_then(as_number)?,
                    map.get("w").or_else(|| map.get("width")).and_then(as_number)?,
                    map.get("h").or_else(|| map.get("height")).and_then(as_number)?,
                ))
            }
            Value::Array(vals) if vals.len() == 4 => {
                let n: Vec<f64> = vals.iter().filter_map(as_number).collect();
                if n.len() == 4 {
                    return Some(NormalizedBox::new(n[0], n[1], n[2], n[3]));
                }
            }
            _ => {}
        }
    }
    Some(NormalizedBox::new(
        item.x.as_ref().and_then(as_number)?,
        item.y.as_ref().and_then(as_number)?,
        item.w.as_ref().and_then(as_number)?,
        item.h.as_ref().and_then(as_number)?,
    ))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
