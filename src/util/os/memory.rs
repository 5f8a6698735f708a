use crate::util::address::Address;
use std::io::{Error, ErrorKind, Result};

/// The protection flags for a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmapProtection {
    /// Do not allow any access
    NoAccess,
    /// Allow read
    ReadOnly,
    /// Allow read + write
    ReadWrite,
    /// Allow read + code execution
    ReadExec,
    /// Allow read + write + code execution
    ReadWriteExec,
}

impl MmapProtection {
    pub fn into_native_flags(self) -> libc::c_int {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::NoAccess => PROT_NONE,
            Self::ReadOnly => PROT_READ,
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadExec => PROT_READ | PROT_EXEC,
            Self::ReadWriteExec => PROT_READ | PROT_WRITE | PROT_EXEC,
        }
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Self::ReadExec | Self::ReadWriteExec)
    }
}

/// Annotation for an mmap entry. On Linux the annotation becomes the name of the
/// anonymous mapping (visible in `/proc/self/maps`), which helps when debugging.
pub enum MmapAnnotation<'a> {
    /// A page-allocator segment.
    Segment,
    /// A section of the process-wide card table.
    CardTable,
    /// The pre-reserved custom-heap region.
    PreReserved,
    /// The mmap is for a test case.  Usually constructed using the [`mmap_anno_test!`] macro.
    Test {
        /// The source file.
        file: &'a str,
        /// The line number.
        line: u32,
    },
    /// For all other use cases.
    Misc {
        /// A human-readable descriptive name.
        name: &'a str,
    },
}

/// Construct an `MmapAnnotation::Test` with the current file name and line number.
#[macro_export]
macro_rules! mmap_anno_test {
    () => {
        &$crate::util::os::MmapAnnotation::Test {
            file: file!(),
            line: line!(),
        }
    };
}

impl std::fmt::Display for MmapAnnotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmapAnnotation::Segment => write!(f, "recycler:segment"),
            MmapAnnotation::CardTable => write!(f, "recycler:cardtable"),
            MmapAnnotation::PreReserved => write!(f, "recycler:prereserved"),
            MmapAnnotation::Test { file, line } => write!(f, "recycler:test:{file}:{line}"),
            MmapAnnotation::Misc { name } => write!(f, "recycler:misc:{name}"),
        }
    }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn mmap_raw(
    hint: Option<Address>,
    size: usize,
    prot: MmapProtection,
    extra_flags: libc::c_int,
    annotation: &MmapAnnotation<'_>,
) -> Result<Address> {
    let mut flags = libc::MAP_ANON | libc::MAP_PRIVATE | extra_flags;
    if hint.is_some() {
        flags |= fixed_noreplace_flag();
    }
    let want = hint.map_or(std::ptr::null_mut(), |a| a.to_mut_ptr::<libc::c_void>());
    let ret = unsafe { libc::mmap(want, size, prot.into_native_flags(), flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    let start = Address::from_mut_ptr(ret);
    if let Some(hint) = hint {
        // Kernels without MAP_FIXED_NOREPLACE treat it as a plain hint.
        if start != hint {
            let _ = munmap(start, size);
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("{} is already mapped", hint),
            ));
        }
    }
    set_vma_name(start, size, annotation);
    Ok(start)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fixed_noreplace_flag() -> libc::c_int {
    libc::MAP_FIXED_NOREPLACE
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fixed_noreplace_flag() -> libc::c_int {
    0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_vma_name(start: Address, size: usize, annotation: &MmapAnnotation) {
    // `PR_SET_VMA` is new in Linux 5.17. Older kernels return `EINVAL`, which we only log
    // because the name is purely for debugging.
    let Ok(anno_cstr) = std::ffi::CString::new(annotation.to_string()) else {
        return;
    };
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        trace!("Error while calling prctl: {e}");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_vma_name(_start: Address, _size: usize, _annotation: &MmapAnnotation) {}

/// Reserve address space without committing it. The range is inaccessible until
/// [`commit`] is called on (parts of) it.
pub fn mmap_reserve(
    hint: Option<Address>,
    size: usize,
    annotation: &MmapAnnotation<'_>,
) -> Result<Address> {
    mmap_raw(
        hint,
        size,
        MmapProtection::NoAccess,
        libc::MAP_NORESERVE,
        annotation,
    )
}

/// Demand-zero mmap: reserve and commit in one step.
/// This function guarantees to zero all mapped memory.
pub fn dzmmap(
    hint: Option<Address>,
    size: usize,
    prot: MmapProtection,
    annotation: &MmapAnnotation<'_>,
) -> Result<Address> {
    mmap_raw(hint, size, prot, 0, annotation)
}

/// Commit a range inside an existing reservation.
pub fn commit(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    mprotect(start, size, prot)
}

/// Give the physical pages of a range back to the OS, keeping the reservation.
/// The range reads as zero once it is committed again.
pub fn decommit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )?;
    mprotect(start, size, MmapProtection::NoAccess)
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

pub fn mprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.into_native_flags()) },
        0,
    )
}

/// Set a memory region to zero.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a memory region to a specific value.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes::<u8>(start.to_mut_ptr(), val, len);
    }
}

/// Check whether the given OS error indicates an out-of-memory condition.
pub fn is_mmap_oom(error: &Error) -> bool {
    error.kind() == ErrorKind::OutOfMemory || error.raw_os_error() == Some(libc::ENOMEM)
}

/// Get the total memory of the system in bytes.
pub fn get_system_total_memory() -> Result<u64> {
    use sysinfo::MemoryRefreshKind;
    use sysinfo::{RefreshKind, System};

    // Only load the memory component; loading everything is slow.
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    Ok(sys.total_memory())
}

/// Get the memory maps for the process. The returned string is a multi-line string.
/// This is only meant to be used for debugging.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn get_process_memory_maps() -> Result<String> {
    std::fs::read_to_string("/proc/self/maps")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn reserve_commit_decommit() {
        let size = 4 * BYTES_IN_PAGE;
        let start = mmap_reserve(None, size, mmap_anno_test!()).unwrap();
        assert!(start.is_aligned_to(BYTES_IN_PAGE));
        commit(start, BYTES_IN_PAGE, MmapProtection::ReadWrite).unwrap();
        unsafe {
            start.store(42usize);
            assert_eq!(start.load::<usize>(), 42);
        }
        decommit(start, BYTES_IN_PAGE).unwrap();
        // Decommitted memory comes back zeroed.
        commit(start, BYTES_IN_PAGE, MmapProtection::ReadWrite).unwrap();
        unsafe {
            assert_eq!(start.load::<usize>(), 0);
        }
        munmap(start, size).unwrap();
    }

    #[test]
    fn dzmmap_is_zeroed() {
        let start = dzmmap(None, BYTES_IN_PAGE, MmapProtection::ReadWrite, mmap_anno_test!())
            .unwrap();
        unsafe {
            assert_eq!(start.load::<u64>(), 0);
            assert_eq!((start + (BYTES_IN_PAGE - 8)).load::<u64>(), 0);
        }
        munmap(start, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn hinted_reserve_does_not_replace() {
        let size = 2 * BYTES_IN_PAGE;
        let start = mmap_reserve(None, size, mmap_anno_test!()).unwrap();
        let res = mmap_reserve(Some(start), size, mmap_anno_test!());
        assert!(res.is_err());
        munmap(start, size).unwrap();
    }

    #[test]
    fn system_memory_is_known() {
        assert!(get_system_total_memory().unwrap() > 0);
    }
}
