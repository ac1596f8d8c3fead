//! Persisted record types and the external reference formats.
//!
//! Downstream retrieval and action-extraction components address sections as
//! `RAG_<manual_id>_<start_page>` and the images of a page as
//! `IMG_<manual_id>_<page>`; both are parsed and rendered here.

use crate::config::Classification;
use crate::error::IngestError;
use crate::pipeline::geometry::NormalizedBox;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// One ingested manual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualInfo {
    pub id: i64,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub classification: Classification,
}

/// A contiguous page range under one detected heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub id: i64,
    pub manual_id: i64,
    pub parent_id: Option<i64>,
    pub start_page: u32,
    pub end_page: u32,
    pub level: u32,
    pub name: String,
    /// Position among the sections of this manual sharing `start_page`
    /// (0 = first created).
    pub ordinal: u32,
}

impl SectionInfo {
    /// Stable external reference. The ordinal suffix is only emitted when
    /// another section already starts on the same page.
    pub fn section_ref(&self) -> SectionRef {
        SectionRef {
            manual_id: self.manual_id,
            start_page: self.start_page,
            ordinal: (self.ordinal > 0).then_some(self.ordinal),
        }
    }

    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start_page..=self.end_page
    }

    /// True when `other`'s page range lies inside this section's range.
    pub fn contains_range(&self, start_page: u32, end_page: u32) -> bool {
        self.start_page <= start_page && end_page <= self.end_page
    }
}

/// A detected diagram/photo region on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: i64,
    pub manual_id: i64,
    pub page: u32,
    pub bbox: NormalizedBox,
    pub description: String,
}

/// Section row awaiting insertion; the store assigns `id` and `ordinal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSection {
    pub parent_id: Option<i64>,
    pub start_page: u32,
    pub end_page: u32,
    pub level: u32,
    pub name: String,
}

/// Image row awaiting insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImage {
    pub page: u32,
    pub bbox: NormalizedBox,
    pub description: String,
}

// ── Section references ───────────────────────────────────────────────────

static RE_SECTION_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^RAG_(\d+)_(\d+)(?:_(\d+))?$").unwrap());

static RE_IMAGE_PAGE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^IMG_(\d+)_(\d+)$").unwrap());

/// `RAG_<manual_id>_<start_page>[_<ordinal>]`.
///
/// Without an ordinal the reference means the first section starting on the
/// page; `_<n>` selects the n-th (0-based) one when several headings share
/// a start page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionRef {
    pub manual_id: i64,
    pub start_page: u32,
    pub ordinal: Option<u32>,
}

impl SectionRef {
    pub fn new(manual_id: i64, start_page: u32) -> Self {
        Self {
            manual_id,
            start_page,
            ordinal: None,
        }
    }

    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = Some(ordinal);
        self
    }
}

impl fmt::Display for SectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RAG_{}_{}", self.manual_id, self.start_page)?;
        if let Some(n) = self.ordinal {
            write!(f, "_{n}")?;
        }
        Ok(())
    }
}

impl FromStr for SectionRef {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RE_SECTION_REF
            .captures(s.trim())
            .ok_or_else(|| IngestError::InputInvalid(format!("invalid section reference '{s}'")))?;
        let bad = |_| IngestError::InputInvalid(format!("section reference '{s}' out of range"));
        Ok(SectionRef {
            manual_id: caps[1].parse().map_err(bad)?,
            start_page: caps[2].parse().map_err(bad)?,
            ordinal: caps
                .get(3)
                .map(|m| m.as_str().parse())
                .transpose()
                .map_err(bad)?,
        })
    }
}

/// `IMG_<manual_id>_<page>`: all image regions detected on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImagePageRef {
    pub manual_id: i64,
    pub page: u32,
}

impl fmt::Display for ImagePageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IMG_{}_{}", self.manual_id, self.page)
    }
}

impl FromStr for ImagePageRef {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = RE_IMAGE_PAGE_REF
            .captures(s.trim())
            .ok_or_else(|| IngestError::InputInvalid(format!("invalid image reference '{s}'")))?;
        let bad = |_| IngestError::InputInvalid(format!("image reference '{s}' out of range"));
        Ok(ImagePageRef {
            manual_id: caps[1].parse().map_err(bad)?,
            page: caps[2].parse().map_err(bad)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(start: u32, end: u32, ordinal: u32) -> SectionInfo {
        SectionInfo {
            id: 1,
            manual_id: 6,
            parent_id: None,
            start_page: start,
            end_page: end,
            level: 1,
            name: "Engine".into(),
            ordinal,
        }
    }

    #[test]
    fn section_ref_roundtrip() {
        let r: SectionRef = "RAG_1_45".parse().unwrap();
        assert_eq!(r, SectionRef::new(1, 45));
        assert_eq!(r.to_string(), "RAG_1_45");

        let r: SectionRef = "RAG_1_45_2".parse().unwrap();
        assert_eq!(r.ordinal, Some(2));
        assert_eq!(r.to_string(), "RAG_1_45_2");
    }

    #[test]
    fn section_ref_rejects_garbage() {
        for bad in ["RAG_1", "rag_1_2", "RAG_a_2", "IMG_1_2", "RAG_1_2_3_4", ""] {
            assert!(bad.parse::<SectionRef>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn first_section_on_page_has_plain_ref() {
        assert_eq!(section(3, 3, 0).section_ref().to_string(), "RAG_6_3");
        assert_eq!(section(3, 3, 1).section_ref().to_string(), "RAG_6_3_1");
    }

    #[test]
    fn contains_range() {
        let s = section(2, 6, 0);
        assert!(s.contains_range(2, 6));
        assert!(s.contains_range(3, 4));
        assert!(!s.contains_range(1, 3));
        assert!(!s.contains_range(5, 7));
        assert_eq!(s.pages().count(), 5);
    }

    #[test]
    fn image_page_ref_roundtrip() {
        let r: ImagePageRef = "IMG_4_12".parse().unwrap();
        assert_eq!(r, ImagePageRef { manual_id: 4, page: 12 });
        assert_eq!(r.to_string(), "IMG_4_12");
        assert!("IMG_4".parse::<ImagePageRef>().is_err());
    }
}
