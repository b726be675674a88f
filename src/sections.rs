//! Section renderer: merges ranked chunks back into bounded text.
//!
//! Chunks of one document are greedily concatenated in original order
//! into sections. A new section starts whenever appending the next chunk
//! would exceed the character budget; chunks are never truncated
//! mid-chunk, so a single oversized chunk becomes a section of its own.
//!
//! Rendering is lazy: [`render_all_sections`] returns an [`Iterator`],
//! and callers may take a prefix without paying for unrendered sections.
//! The iterator borrows the chunk slice, so it can be restarted by
//! calling [`render_all_sections`] again.

use crate::models::{Chunk, Section};

/// Lazy section iterator over one document's chunks.
pub struct SectionIter<'a> {
    chunks: &'a [Chunk],
    max_chars: usize,
    next: usize,
}

impl Iterator for SectionIter<'_> {
    type Item = Section;

    fn next(&mut self) -> Option<Section> {
        if self.next >= self.chunks.len() {
            return None;
        }

        let first = self.next;
        let mut text = self.chunks[first].text.clone();
        self.next += 1;

        while self.next < self.chunks.len() {
            let candidate = &self.chunks[self.next].text;
            if text.len() + 1 + candidate.len() > self.max_chars {
                break;
            }
            text.push('\n');
            text.push_str(candidate);
            self.next += 1;
        }

        Some(Section {
            text,
            first_chunk: self.chunks[first].chunk_index,
            last_chunk: self.chunks[self.next - 1].chunk_index,
        })
    }
}

/// Render `chunks` (in original document order) into sections of at most
/// `max_chars` characters each.
pub fn render_all_sections(chunks: &[Chunk], max_chars: usize) -> SectionIter<'_> {
    SectionIter {
        chunks,
        max_chars,
        next: 0,
    }
}
