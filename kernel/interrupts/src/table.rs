//! Priority-partitioned interrupt vector table.
//!
//! 256 vectors are split into 16 priority classes of 16 vectors each — the
//! architecture's priority encoding uses the upper nibble of the vector
//! number, so a class boundary is also a priority boundary. Classes 0 and 1
//! (vectors 0-31) are the CPU exception range; [`InterruptTable::install_exceptions`]
//! claims them all at boot. Everything else is handed out by [`request`].

use kestrel_core::sync::SpinLock;

/// Total number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;
/// Vectors per priority class.
pub const CLASS_SIZE: u8 = 16;
/// Number of priority classes.
pub const CLASS_COUNT: u8 = 16;
/// First vector reserved for CPU exceptions.
pub const EXCEPTION_BASE: u8 = 0;
/// One past the last vector reserved for CPU exceptions.
pub const EXCEPTION_END: u8 = 32;

/// A handler invoked with the vector number that fired.
pub type Handler = fn(u8);

#[derive(Clone, Copy)]
struct Entry {
    handler: Option<Handler>,
    priority: u8,
}

impl Entry {
    const fn empty() -> Self {
        Self { handler: None, priority: 0 }
    }
}

/// Errors from vector allocation and registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    /// `priority` is outside `0..CLASS_COUNT`.
    InvalidPriority,
    /// Every vector in the requested priority class already has a handler.
    ClassExhausted,
    /// [`set`] targeted a vector that already has a handler.
    AlreadyRegistered,
}

impl core::fmt::Display for InterruptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidPriority => write!(f, "priority class out of range"),
            Self::ClassExhausted => write!(f, "priority class has no free vector"),
            Self::AlreadyRegistered => write!(f, "vector already has a handler"),
        }
    }
}

/// A 256-entry interrupt vector table, partitioned into priority classes.
pub struct InterruptTable {
    entries: [Entry; VECTOR_COUNT],
}

impl InterruptTable {
    /// Creates a table with every vector free.
    pub const fn new() -> Self {
        Self { entries: [Entry::empty(); VECTOR_COUNT] }
    }

    /// Claims every vector in the CPU exception range (0-31) for `handler`.
    pub fn install_exceptions(&mut self, handler: Handler) {
        let mut v = EXCEPTION_BASE;
        while v < EXCEPTION_END {
            self.entries[v as usize] = Entry { handler: Some(handler), priority: v / CLASS_SIZE };
            v += 1;
        }
    }

    /// Scans `priority`'s class starting at `priority * CLASS_SIZE` and
    /// registers `handler` at the lowest free vector found.
    pub fn request(&mut self, priority: u8, handler: Handler) -> Result<u8, InterruptError> {
        if priority >= CLASS_COUNT {
            return Err(InterruptError::InvalidPriority);
        }
        let base = priority * CLASS_SIZE;
        for offset in 0..CLASS_SIZE {
            let vector = base + offset;
            if self.entries[vector as usize].handler.is_none() {
                self.entries[vector as usize] = Entry { handler: Some(handler), priority };
                return Ok(vector);
            }
        }
        Err(InterruptError::ClassExhausted)
    }

    /// Registers `handler` at a specific vector (e.g. the LAPIC timer or
    /// spurious vector), failing if it is already claimed.
    pub fn set(&mut self, vector: u8, priority: u8, handler: Handler) -> Result<(), InterruptError> {
        if priority >= CLASS_COUNT {
            return Err(InterruptError::InvalidPriority);
        }
        let entry = &mut self.entries[vector as usize];
        if entry.handler.is_some() {
            return Err(InterruptError::AlreadyRegistered);
        }
        *entry = Entry { handler: Some(handler), priority };
        Ok(())
    }

    /// Returns the handler registered at `vector`, if any.
    pub fn handler(&self, vector: u8) -> Option<Handler> {
        self.entries[vector as usize].handler
    }
}

/// The global interrupt table, installed during boot and consulted by
/// every dispatch stub thereafter.
static TABLE: SpinLock<InterruptTable> = SpinLock::new(InterruptTable::new());

/// Claims every exception vector (0-31) for `handler`. Called once during
/// boot, before the IDT is loaded.
pub fn install_exceptions(handler: Handler) {
    TABLE.lock().install_exceptions(handler);
}

/// Allocates a vector in `priority`'s class. See [`InterruptTable::request`].
pub fn request(priority: u8, handler: Handler) -> Result<u8, InterruptError> {
    TABLE.lock().request(priority, handler)
}

/// Registers `handler` at a fixed vector. See [`InterruptTable::set`].
pub fn set(vector: u8, priority: u8, handler: Handler) -> Result<(), InterruptError> {
    TABLE.lock().set(vector, priority, handler)
}

/// Dispatches a delivered hardware interrupt: invokes the registered
/// handler (if any) and EOIs the LAPIC. Exception vectors (<32) are routed
/// here too but never EOI'd, since they aren't acknowledged through the
/// LAPIC.
pub fn dispatch(vector: u8) {
    let handler = TABLE.lock().handler(vector);
    if let Some(handler) = handler {
        handler(vector);
    }
    if vector >= EXCEPTION_END {
        crate::lapic::eoi(vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_vector: u8) {}

    #[test]
    fn request_starts_at_priority_class_base() {
        let mut table = InterruptTable::new();
        let vector = table.request(3, noop).unwrap();
        assert_eq!(vector, 3 * CLASS_SIZE);
    }

    #[test]
    fn request_returns_lowest_free_vector_in_class() {
        let mut table = InterruptTable::new();
        let first = table.request(5, noop).unwrap();
        let second = table.request(5, noop).unwrap();
        assert_eq!(first, 5 * CLASS_SIZE);
        assert_eq!(second, 5 * CLASS_SIZE + 1);
    }

    #[test]
    fn request_exhausts_class_without_touching_others() {
        let mut table = InterruptTable::new();
        for _ in 0..CLASS_SIZE {
            table.request(1, noop).unwrap();
        }
        assert_eq!(table.request(1, noop), Err(InterruptError::ClassExhausted));
        // Priority class 2 is untouched.
        assert_eq!(table.request(2, noop), Ok(2 * CLASS_SIZE));
    }

    #[test]
    fn install_exceptions_claims_vectors_0_to_31() {
        let mut table = InterruptTable::new();
        table.install_exceptions(noop);
        assert!(table.handler(0).is_some());
        assert!(table.handler(31).is_some());
        assert!(table.handler(32).is_none());
        // Priority classes 0 and 1 (vectors 0-31) are fully claimed.
        assert_eq!(table.request(0, noop), Err(InterruptError::ClassExhausted));
        assert_eq!(table.request(1, noop), Err(InterruptError::ClassExhausted));
    }

    #[test]
    fn set_rejects_already_registered_vector() {
        let mut table = InterruptTable::new();
        table.set(200, 12, noop).unwrap();
        assert_eq!(table.set(200, 12, noop), Err(InterruptError::AlreadyRegistered));
    }

    #[test]
    fn invalid_priority_rejected() {
        let mut table = InterruptTable::new();
        assert_eq!(table.request(16, noop), Err(InterruptError::InvalidPriority));
    }
}
