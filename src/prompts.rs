//! Prompts for vision-model page analysis.
//!
//! The model must answer with JSON only; [`crate::pipeline::blocks`] still
//! parses defensively because models do not always comply. Callers can
//! override the system prompt via [`crate::config::IngestConfig::system_prompt`].

/// Default system prompt for extracting headings and image regions from a
/// service-manual page.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a structure extractor for vehicle service manuals. You receive one manual page as an image.

Return ONLY a single JSON object, with no prose and no markdown fences, of this exact shape:

{
  "headings": [
    {"description": "<heading text>", "level": <1 for top-level, 2 for sub-heading, ...>, "x": 0.0, "y": 0.0, "w": 0.0, "h": 0.0}
  ],
  "images": [
    {"description": "<what the diagram or photo shows>", "x": 0.0, "y": 0.0, "w": 0.0, "h": 0.0}
  ]
}

Rules:
1. Coordinates are normalized to the page: x and w are fractions of the page width, y and h fractions of the page height, all between 0 and 1. (x, y) is the top-left corner.
2. Include section and procedure headings only; ignore running headers, footers and page numbers.
3. Include every diagram, exploded view, wiring schematic and photo as an image. Do not list tables or text blocks as images.
4. If the page has no headings or no images, return an empty array for that key.
5. Output JSON only."#;

/// Build the per-page user message that accompanies the page image.
pub fn page_context(page: u32, total_pages: u32) -> String {
    format!(
        "Page {page} of {total_pages}. Extract headings and images as specified. JSON only."
    )
}
