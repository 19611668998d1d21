use core::fmt;

/// The arena could not be grown enough to satisfy a request.
///
/// Either the [`ArenaProvider`](../allocators/trait.ArenaProvider.html)
/// refused to hand out more memory, or the request was too large to be
/// represented at all. The allocator stays usable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// Payload bytes that were being looked for.
    pub requested: usize,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena exhausted while looking for {} bytes", self.requested)
    }
}
