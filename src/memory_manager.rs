//! Host-to-recycler interface: safe Rust APIs.
//!
//! This module is the API a host runtime calls. We expect a host to wrap it
//! and expose what it needs to native code, taking responsibility for the
//! unsafety of handing a `&mut Recycler` across that boundary.
//!
//! A host initializes the recycler in the following steps:
//!
//! 1. Create the process-wide [`ProcessContext`] once.
//! 2. Build [`Options`] and adjust them with [`process()`] or [`process_bulk()`].
//! 3. Register its object kinds in an [`ObjectKindTable`].
//! 4. Call [`recycler_init()`] for every heap it needs.
//!
//! Dropping the [`Recycler`] shuts it down: pending finalizable objects are
//! disposed and its pages go back to the OS. The context is torn down last,
//! with [`ProcessContext::teardown`].

use std::sync::Arc;

use crate::context::ProcessContext;
use crate::policy::attributes::ObjectAttributes;
use crate::recycler::{CollectionFlags, CollectionStats, Recycler, WeakReference};
use crate::util::constants::LOG_BYTES_IN_PAGE;
use crate::util::error::{AllocationError, PageError};
use crate::util::options::Options;
use crate::util::os::MmapProtection;
use crate::util::Address;
use crate::vm::{HostBinding, ObjectKindTable};

/// Create a recycler. This attempts to initialize the logger. If the host
/// would like to use its own logger, it should initialize it before calling
/// this.
///
/// Arguments:
/// * `context`: The process context the recycler shares its card table with.
/// * `options`: The options for this recycler.
/// * `kinds`: The object kinds the host allocates.
/// * `host`: The host's root enumeration and out-of-memory handling.
pub fn recycler_init(
    context: &Arc<ProcessContext>,
    options: Options,
    kinds: ObjectKindTable,
    host: Arc<dyn HostBinding>,
) -> Box<Recycler> {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("The recycler initialized the logger."),
        Err(_) => debug!("The recycler failed to initialize the logger. Possibly a logger has been initialized by user."),
    }
    let recycler = Recycler::new(context, options, kinds, host);
    info!("Initialized {} with {:?}", recycler.id(), recycler.options());
    Box::new(recycler)
}

/// Allocate a zeroed object. The allocation may collect first. If the heap is
/// exhausted even after a full collection, the host's
/// [`HostBinding::out_of_memory`] is called.
///
/// Arguments:
/// * `recycler`: The recycler to allocate from.
/// * `size`: The number of bytes required for the object.
/// * `attributes`: Leaf, finalizable and tracked bits plus the object kind.
#[inline(always)]
pub fn alloc(recycler: &mut Recycler, size: usize, attributes: ObjectAttributes) -> Address {
    recycler.alloc(size, attributes)
}

/// Same as [`alloc()`], but returns `None` instead of calling the host's
/// out-of-memory handler.
#[inline(always)]
pub fn alloc_nothrow(recycler: &mut Recycler, size: usize, attributes: ObjectAttributes) -> Option<Address> {
    recycler.alloc_nothrow(size, attributes)
}

/// Allocate an object whose words are scanned for pointers.
pub fn alloc_normal(recycler: &mut Recycler, size: usize) -> Address {
    recycler.alloc(size, ObjectAttributes::NONE)
}

/// Allocate an object that holds no references.
pub fn alloc_leaf(recycler: &mut Recycler, size: usize) -> Address {
    recycler.alloc(size, ObjectAttributes::LEAF)
}

/// Give a small or medium object back before it becomes garbage. Returns false
/// if the object cannot be freed explicitly, e.g. during a collection.
pub fn free(recycler: &mut Recycler, object: Address) -> bool {
    recycler.explicit_free(object)
}

/// The subsuming write barrier. Stores `target` into `slot` and records the
/// store for the next rescan. A host that does the store itself calls
/// [`object_reference_write_post()`] instead.
///
/// Arguments:
/// * `recycler`: The recycler `slot` belongs to.
/// * `slot`: The location of the field to be modified.
/// * `target`: The value written.
///
/// # Safety
/// `slot` must be a writable, word-aligned field.
#[inline(always)]
pub unsafe fn object_reference_write(recycler: &Recycler, slot: Address, target: Address) {
    recycler.write_reference(slot, target);
}

/// The write barrier for a store the host already made to `slot`.
#[inline(always)]
pub fn object_reference_write_post(recycler: &Recycler, slot: Address) {
    recycler.write_barrier(slot);
}

/// Pin an object so it survives regardless of reachability. Pins are counted.
/// Returns the new pin count.
pub fn root_add_ref(recycler: &mut Recycler, object: Address) -> usize {
    recycler.root_add_ref(object)
}

/// Drop one pin. Returns false if the object was not pinned.
pub fn root_release(recycler: &mut Recycler, object: Address) -> bool {
    recycler.root_release(object)
}

/// Request a collection. `flags` selects which heuristics gate it and how it
/// runs, see [`CollectionFlags`]. Returns true if a collection ran or was
/// started.
pub fn collect_now(recycler: &mut Recycler, flags: CollectionFlags) -> bool {
    recycler.collect_now(flags)
}

/// Trigger a full collection as requested by the user: in-thread, followed by
/// dispose.
pub fn handle_user_collection_request(recycler: &mut Recycler) -> bool {
    recycler.collect_now(CollectionFlags::COLLECT_NOW_FORCE_IN_THREAD)
}

/// Statistics of the last completed collection.
pub fn last_collection_stats(recycler: &Recycler) -> Option<&CollectionStats> {
    recycler.last_collection_stats()
}

/// Process a run-time option. Returns true if the option is processed
/// successfully.
///
/// Arguments:
/// * `options`: The options being built.
/// * `name`: The name of the option, snake case or camel case.
/// * `value`: The value of the option (as a string).
pub fn process(options: &mut Options, name: &str, value: &str) -> bool {
    options.set_from_camelcase_str(name, value)
}

/// Process multiple run-time options. Returns true if all the options are
/// processed successfully.
///
/// Arguments:
/// * `options`: The options being built.
/// * `bulk`: key value pairs separated by white spaces, e.g. "partial_collect=false scan_stack=true"
pub fn process_bulk(options: &mut Options, bulk: &str) -> bool {
    options.set_bulk_from_command_line(bulk)
}

/// Return the memory in use by heap blocks, in bytes.
pub fn used_bytes(recycler: &Recycler) -> usize {
    recycler.used_pages() << LOG_BYTES_IN_PAGE
}

/// Return the memory committed but kept free for reuse, in bytes.
pub fn free_bytes(recycler: &Recycler) -> usize {
    recycler.page_allocator().free_page_count() << LOG_BYTES_IN_PAGE
}

/// Is `object` the start of an allocated object?
pub fn is_recycler_object(recycler: &Recycler, object: Address) -> bool {
    recycler.is_allocated_object(object)
}

/// Visit every allocated object carrying all the bits of `filter`. Returns
/// the number of objects visited.
pub fn enumerate_objects<F>(recycler: &Recycler, filter: ObjectAttributes, f: F) -> usize
where
    F: FnMut(Address, usize, ObjectAttributes),
{
    recycler.enumerate_objects(filter, f)
}

/// Create a weak reference to `object`. Weak references to the same object
/// share one entry.
pub fn create_weak_reference(recycler: &mut Recycler, object: Address) -> WeakReference {
    recycler.create_weak_reference(object)
}

/// The target of a weak reference, or `None` once it has been collected.
pub fn get_weak_reference(recycler: &Recycler, weak: &WeakReference) -> Option<Address> {
    recycler.get_weak_reference(weak)
}

/// Give free pages back to the OS now, e.g. when the host goes idle. Returns
/// the number of pages decommitted.
pub fn decommit_now(recycler: &mut Recycler) -> usize {
    recycler.decommit_now()
}

/// Allocate `pages` committed pages for generated code, outside the collected
/// heap. They come from the pre-reserved region when `pre_reserved_region_size`
/// is set, and are committed executable first when `code_integrity_guard` is.
pub fn alloc_code_pages(
    recycler: &Recycler,
    pages: usize,
    prot: MmapProtection,
) -> Result<Address, AllocationError> {
    recycler.page_allocator().alloc_custom_heap_pages(pages, prot)
}

/// Give a code allocation's physical pages back, keeping its address range.
pub fn decommit_code_pages(recycler: &Recycler, start: Address) -> Result<(), PageError> {
    recycler.page_allocator().decommit_custom_heap_pages(start)
}

pub fn recommit_code_pages(recycler: &Recycler, start: Address, prot: MmapProtection) -> Result<(), PageError> {
    recycler.page_allocator().recommit_custom_heap_pages(start, prot)
}

/// Return pages obtained from [`alloc_code_pages()`].
pub fn release_code_pages(recycler: &Recycler, start: Address) -> Result<(), PageError> {
    recycler.page_allocator().release_custom_heap_pages(start)
}
