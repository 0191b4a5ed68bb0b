// Char-addressed content editing.
//
// Operation positions and lengths count chars, not bytes. Splicing
// converts to byte indices and clamps ranges at the end of the content,
// so an already-transformed operation can never slice mid-codepoint or
// panic past the end.

use tandem_common::types::{DocumentOperation, OperationKind};

/// Applies a single operation's edit to document content in place.
pub fn apply_edit(content: &mut String, op: &DocumentOperation) {
    match op.kind {
        OperationKind::Insert => {
            let at = char_to_byte(content, op.position);
            content.insert_str(at, &op.payload);
        }
        OperationKind::Delete => {
            let (start, end) = char_range_to_bytes(content, op.position, op.length);
            content.replace_range(start..end, "");
        }
        OperationKind::Replace => {
            let (start, end) = char_range_to_bytes(content, op.position, op.length);
            content.replace_range(start..end, &op.payload);
        }
        OperationKind::Modify => {
            op.payload.clone_into(content);
        }
    }
}

/// Number of chars in `content`. Positions are compared against this.
pub fn char_len(content: &str) -> usize {
    content.chars().count()
}

/// Byte index of the `char_pos`-th char; clamps past-end to `content.len()`.
fn char_to_byte(content: &str, char_pos: usize) -> usize {
    content.char_indices().nth(char_pos).map(|(index, _)| index).unwrap_or(content.len())
}

fn char_range_to_bytes(content: &str, start_char: usize, len_chars: usize) -> (usize, usize) {
    let start = char_to_byte(content, start_char);
    let end = char_to_byte(content, start_char.saturating_add(len_chars));
    (start, end)
}
