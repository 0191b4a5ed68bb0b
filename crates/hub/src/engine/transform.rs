// Operational-transform position rebasing.
//
// When an operation arrives with a stale base version, every operation
// applied after that base is replayed over it, oldest first. Each step
// adjusts the incoming position so it lands where the author aimed in
// the content they were actually looking at:
//
// - prior insert shifts later positions right (ties shift too);
// - prior delete shifts later positions left, and a position strictly
//   inside the removed range collapses to the range start;
// - prior replace composes the delete rule with the insert rule;
// - prior modify invalidates positional context entirely, so the
//   position clamps into the new content.
//
// Incoming whole-field `modify` operations carry no position semantics
// and pass through unchanged (last write wins).

use tandem_common::types::{DocumentOperation, OperationKind};

use crate::engine::document::char_len;

/// One operation rebased over one prior, plus whether the position had
/// to be collapsed rather than shifted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub op: DocumentOperation,
    pub clamped: bool,
}

/// Rebases `op` over a single already-applied `prior` operation.
pub fn transform_against(mut op: DocumentOperation, prior: &DocumentOperation) -> Transformed {
    if op.kind == OperationKind::Modify {
        return Transformed { op, clamped: false };
    }

    let clamped = match prior.kind {
        OperationKind::Insert => {
            shift_for_insert(&mut op, prior.position, char_len(&prior.payload));
            false
        }
        OperationKind::Delete => shift_for_delete(&mut op, prior.position, prior.length),
        OperationKind::Replace => {
            let clamped = shift_for_delete(&mut op, prior.position, prior.length);
            shift_for_insert(&mut op, prior.position, char_len(&prior.payload));
            clamped
        }
        OperationKind::Modify => {
            op.position = op.position.min(char_len(&prior.payload));
            true
        }
    };

    Transformed { op, clamped }
}

fn shift_for_insert(op: &mut DocumentOperation, at: usize, inserted: usize) {
    if op.position >= at {
        op.position = op.position.saturating_add(inserted);
    }
}

/// Returns true when the position fell strictly inside the removed range
/// and was collapsed to its start.
fn shift_for_delete(op: &mut DocumentOperation, at: usize, removed: usize) -> bool {
    let end = at.saturating_add(removed);
    if op.position >= end {
        op.position = op.position.saturating_sub(removed);
        false
    } else if op.position > at {
        op.position = at;
        true
    } else {
        false
    }
}
