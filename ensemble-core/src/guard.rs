//! Gates for work that must not run while the local user is busy.
//!
//! Remote changes and package reloads are queued and retried every tick
//! until the guard allows them; nothing ever blocks waiting for it.

/// Queried once per tick before applying remote work.
pub trait SuspendGuard {
    /// Remote transactions may be applied now.
    fn can_perform_blocking_action(&self) -> bool;

    /// Packages may be hot-reloaded or purged now.
    fn can_hot_reload_or_purge(&self) -> bool {
        self.can_perform_blocking_action()
    }
}

/// Snapshot of the local editor's busy flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditorState {
    /// The user is in the middle of an interactive edit (drag, gizmo, ...)
    pub is_interacting: bool,
    pub is_saving: bool,
    pub is_collecting_garbage: bool,
    /// Session processing is suspended by the host
    pub is_suspended: bool,
}

impl EditorState {
    /// Reason remote application is currently deferred, if any.
    pub fn blocking_reason(&self) -> Option<&'static str> {
        if self.is_suspended {
            Some("session suspended")
        } else if self.is_saving {
            Some("saving")
        } else if self.is_collecting_garbage {
            Some("collecting garbage")
        } else if self.is_interacting {
            Some("user interaction")
        } else {
            None
        }
    }
}

impl SuspendGuard for EditorState {
    fn can_perform_blocking_action(&self) -> bool {
        self.blocking_reason().is_none()
    }

    // Reloads only conflict with saving and collection, not with interaction
    fn can_hot_reload_or_purge(&self) -> bool {
        !(self.is_suspended || self.is_saving || self.is_collecting_garbage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_editor_allows_everything() {
        let state = EditorState::default();
        assert!(state.can_perform_blocking_action());
        assert!(state.can_hot_reload_or_purge());
        assert_eq!(state.blocking_reason(), None);
    }

    #[test]
    fn test_interaction_only_blocks_remote_apply() {
        let state = EditorState {
            is_interacting: true,
            ..EditorState::default()
        };
        assert!(!state.can_perform_blocking_action());
        assert!(state.can_hot_reload_or_purge());
    }

    #[test]
    fn test_saving_blocks_both() {
        let state = EditorState {
            is_saving: true,
            ..EditorState::default()
        };
        assert!(!state.can_perform_blocking_action());
        assert!(!state.can_hot_reload_or_purge());
        assert_eq!(state.blocking_reason(), Some("saving"));
    }
}
