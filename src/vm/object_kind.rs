use crate::recycler::Recycler;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// Callback trait of trace functions. Every word an object reports is a
/// candidate: it may or may not point into the heap, and the recycler checks.
pub trait ObjectTracer {
    /// Call this function for each field that may hold a reference.
    fn trace_candidate(&mut self, candidate: Address);
}

/// This lets us use closures as ObjectTracer.
impl<F: FnMut(Address)> ObjectTracer for F {
    fn trace_candidate(&mut self, candidate: Address) {
        self(candidate)
    }
}

/// Report every aligned word in `[start, end)` as a candidate.
///
/// # Safety
/// The range must be readable. Words are read with relaxed atomic loads, so
/// the range may be written concurrently.
pub unsafe fn scan_words_conservatively(start: Address, end: Address, tracer: &mut dyn ObjectTracer) {
    let mut cursor = start.align_up(BYTES_IN_WORD);
    while cursor + BYTES_IN_WORD <= end {
        tracer.trace_candidate(cursor.load_word_relaxed());
        cursor = cursor + BYTES_IN_WORD;
    }
}

/// Report the fields of one object.
pub type TraceFn = fn(object: Address, size: usize, tracer: &mut dyn ObjectTracer);
/// Called once, during sweep, when a finalizable object is found unreachable.
/// The object and everything it references are still intact.
pub type FinalizeFn = fn(object: Address, size: usize);
/// Called after sweep, outside the collection, for objects that were finalized.
/// It may allocate. `is_shutdown` is set when the recycler is being dropped.
pub type DisposeFn = fn(recycler: &mut Recycler, object: Address, size: usize, is_shutdown: bool);

/// The per-kind behaviour an embedder registers. The kind of an object is
/// kept in its attribute byte, so objects carry no header of their own.
#[derive(Clone, Copy, Debug)]
pub struct ObjectKindInfo {
    pub name: &'static str,
    /// `None` scans every word of the object conservatively.
    pub trace: Option<TraceFn>,
    pub finalize: Option<FinalizeFn>,
    pub dispose: Option<DisposeFn>,
}

impl ObjectKindInfo {
    pub const fn conservative(name: &'static str) -> Self {
        ObjectKindInfo {
            name,
            trace: None,
            finalize: None,
            dispose: None,
        }
    }

    pub fn trace(&self, object: Address, size: usize, tracer: &mut dyn ObjectTracer) {
        match self.trace {
            Some(trace) => trace(object, size, tracer),
            // SAFETY: the object lies inside a committed heap block.
            None => unsafe { scan_words_conservatively(object, object + size, tracer) },
        }
    }
}

/// Index into the [`ObjectKindTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectKind(u8);

impl ObjectKind {
    /// The built-in kind: no callbacks, every word is a candidate pointer.
    pub const CONSERVATIVE: ObjectKind = ObjectKind(0);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn from_bits(bits: u8) -> Self {
        ObjectKind(bits & (MAX_OBJECT_KINDS as u8 - 1))
    }
}

/// The attribute byte keeps the kind in four bits.
pub const MAX_OBJECT_KINDS: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub struct KindTableFull;

impl std::fmt::Display for KindTableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at most {} object kinds can be registered", MAX_OBJECT_KINDS)
    }
}

impl std::error::Error for KindTableFull {}

/// Kinds are registered before the recycler is created and are immutable after.
#[derive(Clone, Debug)]
pub struct ObjectKindTable {
    kinds: Vec<ObjectKindInfo>,
}

impl ObjectKindTable {
    pub fn new() -> Self {
        ObjectKindTable {
            kinds: vec![ObjectKindInfo::conservative("conservative")],
        }
    }

    pub fn register(&mut self, info: ObjectKindInfo) -> Result<ObjectKind, KindTableFull> {
        if self.kinds.len() == MAX_OBJECT_KINDS {
            return Err(KindTableFull);
        }
        self.kinds.push(info);
        debug!("Registered object kind {} as {}", info.name, self.kinds.len() - 1);
        Ok(ObjectKind((self.kinds.len() - 1) as u8))
    }

    /// Unregistered kinds fall back to the conservative kind.
    pub fn get(&self, kind: ObjectKind) -> &ObjectKindInfo {
        self.kinds.get(kind.index()).unwrap_or(&self.kinds[0])
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ObjectKindTable {
    fn default() -> Self {
        Self::new()
    }
}
