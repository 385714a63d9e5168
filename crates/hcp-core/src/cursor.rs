use std::collections::BTreeMap;
use std::sync::Arc;

/// Last accepted cursor per subscription.
///
/// The map is shared behind an `Arc` so a rejected observation hands back the
/// very same state, which callers can detect with [`ObservedCursorState::ptr_eq`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedCursorState {
    cursors: Arc<BTreeMap<String, u64>>,
}

impl ObservedCursorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, subscription_id: &str) -> Option<u64> {
        self.cursors.get(subscription_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cursors, &other.cursors)
    }

    /// Drops the cursor for a subscription that was closed.
    pub fn forget(&self, subscription_id: &str) -> Self {
        if !self.cursors.contains_key(subscription_id) {
            return self.clone();
        }
        let mut cursors = (*self.cursors).clone();
        cursors.remove(subscription_id);
        Self {
            cursors: Arc::new(cursors),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorUpdate<'a> {
    pub subscription_id: &'a str,
    pub cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorDecision {
    pub accepted: bool,
    pub previous_cursor: Option<u64>,
    pub next_state: ObservedCursorState,
}

/// Accepts `update` only when its cursor advances past the last one recorded
/// for the same subscription.
pub fn observe_cursor(state: &ObservedCursorState, update: CursorUpdate<'_>) -> CursorDecision {
    let previous_cursor = state.cursor(update.subscription_id);
    if previous_cursor.is_some_and(|previous| update.cursor <= previous) {
        return CursorDecision {
            accepted: false,
            previous_cursor,
            next_state: state.clone(),
        };
    }

    let mut cursors = (*state.cursors).clone();
    cursors.insert(update.subscription_id.to_string(), update.cursor);
    CursorDecision {
        accepted: true,
        previous_cursor,
        next_state: ObservedCursorState {
            cursors: Arc::new(cursors),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(subscription_id: &str, cursor: u64) -> CursorUpdate<'_> {
        CursorUpdate {
            subscription_id,
            cursor,
        }
    }

    #[test]
    fn cursors_advance_monotonically_per_subscription() {
        let empty = ObservedCursorState::new();
        assert!(empty.is_empty());

        let first = observe_cursor(&empty, update("A", 10));
        assert!(first.accepted);
        assert_eq!(first.previous_cursor, None);
        assert_eq!(first.next_state.cursor("A"), Some(10));

        let second = observe_cursor(&first.next_state, update("A", 11));
        assert!(second.accepted);
        assert_eq!(second.previous_cursor, Some(10));

        let duplicate = observe_cursor(&second.next_state, update("A", 11));
        assert!(!duplicate.accepted);
        assert_eq!(duplicate.previous_cursor, Some(11));
        assert!(duplicate.next_state.ptr_eq(&second.next_state));

        let regression = observe_cursor(&second.next_state, update("A", 3));
        assert!(!regression.accepted);
        assert_eq!(regression.previous_cursor, Some(11));
        assert!(regression.next_state.ptr_eq(&second.next_state));
    }

    #[test]
    fn subscriptions_are_independent() {
        let state = observe_cursor(&ObservedCursorState::new(), update("A", 50)).next_state;

        let other = observe_cursor(&state, update("B", 1));
        assert!(other.accepted);
        assert_eq!(other.previous_cursor, None);
        assert_eq!(other.next_state.cursor("A"), Some(50));
        assert_eq!(other.next_state.cursor("B"), Some(1));
        assert_eq!(other.next_state.len(), 2);
    }

    #[test]
    fn accepting_never_mutates_the_input_state() {
        let before = observe_cursor(&ObservedCursorState::new(), update("A", 1)).next_state;
        let after = observe_cursor(&before, update("A", 2)).next_state;
        assert_eq!(before.cursor("A"), Some(1));
        assert_eq!(after.cursor("A"), Some(2));
        assert!(!before.ptr_eq(&after));
    }

    #[test]
    fn cursor_zero_is_a_valid_first_position() {
        let decision = observe_cursor(&ObservedCursorState::new(), update("A", 0));
        assert!(decision.accepted);
        let again = observe_cursor(&decision.next_state, update("A", 0));
        assert!(!again.accepted);
    }

    #[test]
    fn forget_resets_a_single_subscription() {
        let state = observe_cursor(&ObservedCursorState::new(), update("A", 9)).next_state;
        let state = observe_cursor(&state, update("B", 4)).next_state;

        let forgotten = state.forget("A");
        assert_eq!(forgotten.cursor("A"), None);
        assert_eq!(forgotten.cursor("B"), Some(4));
        assert!(state.forget("missing").ptr_eq(&state));
        assert!(observe_cursor(&forgotten, update("A", 1)).accepted);
    }
}
