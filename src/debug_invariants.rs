//! Structural self-checks run when coarse meshes and forests are committed.

use crate::mesh_error::MeshForestError;

/// Committed objects that can verify their own structure.
pub trait DebugInvariants {
    /// Panic on a broken invariant when checks are compiled in.
    fn debug_assert_invariants(&self);
    /// The first broken invariant found, if any.
    fn validate_invariants(&self) -> Result<(), MeshForestError>;
}

/// `debug_invariants!(check, "context")` evaluates `check` (a
/// `Result<(), MeshForestError>`) under `debug_assertions` or the
/// `check-invariants`/`strict-invariants` features, and panics with the
/// context on `Err`. Compiles to nothing otherwise.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("mesh-forest: broken invariant after ", $($ctx)*, ": {}"), e);
        }
    };
}
