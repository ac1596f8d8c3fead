//! Section assembly and the derived section hierarchy.
//!
//! Each detected heading becomes one section confined to the page it was
//! seen on: `start_page == end_page`, no parent link, the heading's
//! ancestor trail folded into the name (`"Engine > Cooling"`). A heading
//! continuing onto the next page yields a second section there; ranges are
//! never merged across pages.
//!
//! The hierarchy is not persisted. [`SectionTree`] rebuilds it on demand
//! from reading order and levels.

use crate::model::{NewSection, SectionInfo};
use crate::pipeline::blocks::HeadingBlock;
use serde::Serialize;

/// Turn the headings of one page into section rows, in detection order.
pub fn assemble(page: u32, headings: &[HeadingBlock]) -> Vec<NewSection> {
    headings
        .iter()
        .filter(|h| !h.title.trim().is_empty())
        .map(|h| NewSection {
            parent_id: None,
            start_page: page,
            end_page: page,
            level: h.level.max(1),
            name: h.label(),
        })
        .collect()
}

/// One node of a [`SectionTree`]. `parent` and `children` index into
/// [`SectionTree::nodes`].
#[derive(Debug, Clone, Serialize)]
pub struct SectionNode {
    pub section: SectionInfo,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Arena-backed section hierarchy of one manual.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionTree {
    pub nodes: Vec<SectionNode>,
    pub roots: Vec<usize>,
}

impl SectionTree {
    /// Build from sections in reading order (`start_page`, then id).
    ///
    /// A stored `parent_id` wins when that parent is present. Otherwise the
    /// parent is the nearest preceding section with a smaller level.
    pub fn build(mut sections: Vec<SectionInfo>) -> Self {
        sections.sort_by_key(|s| (s.start_page, s.id));

        let mut tree = SectionTree::default();
        // Open ancestors, strictly increasing in level.
        let mut stack: Vec<usize> = Vec::new();

        for section in sections {
            while let Some(&top) = stack.last() {
                if tree.nodes[top].section.level >= section.level {
                    stack.pop();
                } else {
                    break;
                }
            }

            let explicit = section
                .parent_id
                .and_then(|pid| tree.nodes.iter().position(|n| n.section.id == pid));
            let parent = explicit.or_else(|| stack.last().copied());

            let idx = tree.nodes.len();
            tree.nodes.push(SectionNode {
                section,
                parent,
                children: Vec::new(),
            });
            match parent {
                Some(p) => tree.nodes[p].children.push(idx),
                None => tree.roots.push(idx),
            }
            stack.push(idx);
        }

        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestor chain of `idx`, root first, excluding `idx` itself.
    pub fn ancestors(&self, idx: usize) -> Vec<&SectionInfo> {
        let mut chain = Vec::new();
        let mut cur = self.nodes.get(idx).and_then(|n| n.parent);
        while let Some(p) = cur {
            chain.push(&self.nodes[p].section);
            cur = self.nodes[p].parent;
        }
        chain.reverse();
        chain
    }

    /// Depth-first walk yielding `(depth, section)`, roots at depth 0.
    pub fn walk(&self) -> Vec<(usize, &SectionInfo)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut pending: Vec<(usize, usize)> = self.roots.iter().rev().map(|&r| (0, r)).collect();
        while let Some((depth, idx)) = pending.pop() {
            let node = &self.nodes[idx];
            out.push((depth, &node.section));
            pending.extend(node.children.iter().rev().map(|&c| (depth + 1, c)));
        }
        out
    }
}
