/// Failures surfaced by [`switch`](crate::Cothread::switch).
///
/// A refused switch leaves all coroutine state untouched. Fatal conditions
/// (allocation exhaustion, an action returning through the low-level
/// switch) abort the process instead of reporting here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    /// Coroutine belongs to a different thread
    ForeignCothread,
    /// Coroutine's action has already returned
    Defunct,
}
