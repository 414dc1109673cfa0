//! Observer hooks invoked synchronously from inside engine operations.

use crate::config::ServerId;
use crate::state::RoleKind;

/// Notifications about notable engine state changes.
///
/// Hooks run synchronously within the operation that caused the change and
/// must not call back into the engine.
pub trait Watch {
    fn role_changed(&mut self, _old: RoleKind, _new: RoleKind) {}

    fn committed(&mut self, _index: u64) {}

    fn promotion_aborted(&mut self, _id: ServerId) {}
}
