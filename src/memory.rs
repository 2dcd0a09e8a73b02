//! Backing memory for frame buffers.
//!
//! One type per allocation strategy:
//! - `PinnedMemory`: page-aligned memory the pool allocates itself.
//! - `MappedRegion`: device memory mapped into this process.
//! - `DmaHandle`: a sharable descriptor, exported by the device or imported
//!   from a downstream pool.
//!
//! Descriptors are never reference-counted implicitly. Sharing one means
//! calling `duplicate()`, and every handle is closed with `close()`.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use zeroize::Zeroize;

use crate::buffer::AllocationMode;
use crate::error::{CaptureError, CaptureResult};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// System page size, used as the alignment of self-allocated buffers.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

// ----------------------------------------------------------------------------
// PinnedMemory: self-allocated, page aligned
// ----------------------------------------------------------------------------

/// Page-aligned heap allocation owned by a pool slot.
///
/// Contents are zeroized before the memory is returned to the allocator.
pub struct PinnedMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: PinnedMemory uniquely owns its allocation; access goes through
// &self / &mut self like a Box<[u8]>.
unsafe impl Send for PinnedMemory {}
unsafe impl Sync for PinnedMemory {}

impl PinnedMemory {
    pub fn allocate(size: usize) -> CaptureResult<Self> {
        if size == 0 {
            return Err(CaptureError::InvalidConfig(
                "buffer size must be greater than zero".to_string(),
            ));
        }
        let layout = Layout::from_size_align(size, page_size())
            .map_err(|e| CaptureError::AllocationFailure(format!("bad layout: {}", e)))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            CaptureError::AllocationFailure(format!("out of memory allocating {} bytes", size))
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl fmt::Debug for PinnedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedMemory")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PinnedMemory {
    fn drop(&mut self) {
        self.as_mut_slice().zeroize();
        // SAFETY: ptr was allocated with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// ----------------------------------------------------------------------------
// MappedRegion: device memory mapped into the process
// ----------------------------------------------------------------------------

/// Device memory mapped into this process. The device adapter owns the
/// mapping and unmaps it in `release_memory`.
#[derive(Debug)]
pub struct MappedRegion {
    addr: NonNull<u8>,
    len: usize,
    cookie: u64,
}

// SAFETY: the region is only reachable through the single FrameBuffer that
// owns this value.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wrap a mapping produced by a device adapter.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads and writes of `len` bytes until the
    /// adapter's `release_memory` is called with this region, and nothing
    /// else may access the memory in the meantime.
    pub unsafe fn from_raw_parts(addr: *mut u8, len: usize, cookie: u64) -> Option<Self> {
        NonNull::new(addr).map(|addr| Self { addr, len, cookie })
    }

    pub fn address(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adapter-defined identifier of the mapping.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by the from_raw_parts contract.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the from_raw_parts contract.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

// ----------------------------------------------------------------------------
// DmaHandle: explicitly owned descriptor
// ----------------------------------------------------------------------------

pub type RawDescriptor = i32;

/// Duplicate/close primitives for a descriptor namespace.
pub trait DescriptorOps: Send + Sync + fmt::Debug {
    fn duplicate(&self, raw: RawDescriptor) -> io::Result<RawDescriptor>;
    fn close(&self, raw: RawDescriptor) -> io::Result<()>;
}

/// Plain POSIX file descriptors.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct PosixDescriptors;

#[cfg(unix)]
impl PosixDescriptors {
    pub fn shared() -> Arc<dyn DescriptorOps> {
        Arc::new(Self)
    }
}

#[cfg(unix)]
impl DescriptorOps for PosixDescriptors {
    fn duplicate(&self, raw: RawDescriptor) -> io::Result<RawDescriptor> {
        // SAFETY: dup only reads the descriptor table.
        let fd = unsafe { libc::dup(raw) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn close(&self, raw: RawDescriptor) -> io::Result<()> {
        // SAFETY: the caller owns `raw` and never uses it again.
        if unsafe { libc::close(raw) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// An owned descriptor for sharable buffer memory.
///
/// Not `Clone`: sharing is `duplicate()`, which yields a second handle that
/// must be closed on its own. Dropping an open handle closes it and logs a
/// warning.
#[derive(Debug)]
pub struct DmaHandle {
    raw: RawDescriptor,
    len: usize,
    ops: Arc<dyn DescriptorOps>,
    open: bool,
}

impl DmaHandle {
    /// Take ownership of `raw`.
    pub fn from_raw(raw: RawDescriptor, len: usize, ops: Arc<dyn DescriptorOps>) -> Self {
        Self {
            raw,
            len,
            ops,
            open: true,
        }
    }

    pub fn raw(&self) -> RawDescriptor {
        self.raw
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn duplicate(&self) -> io::Result<DmaHandle> {
        let raw = self.ops.duplicate(self.raw)?;
        Ok(DmaHandle::from_raw(raw, self.len, self.ops.clone()))
    }

    pub fn close(mut self) -> io::Result<()> {
        self.open = false;
        self.ops.close(self.raw)
    }
}

impl Drop for DmaHandle {
    fn drop(&mut self) {
        if self.open {
            log::warn!("descriptor {} dropped without close", self.raw);
            let _ = self.ops.close(self.raw);
        }
    }
}

/// A buffer lent by a downstream pool. Its memory belongs to that pool and
/// goes back through `DownstreamPool::give_back`.
#[derive(Debug)]
pub struct ImportedBuffer {
    pub handle: DmaHandle,
    pub token: u64,
}

/// Memory returned by `DeviceAdapter::allocate_memory`.
#[derive(Debug)]
pub enum DeviceMemory {
    Mapped(MappedRegion),
    Exported(DmaHandle),
}

// ----------------------------------------------------------------------------
// BackingMemory: what a FrameBuffer slot holds
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub enum BackingMemory {
    Pinned(PinnedMemory),
    Mapped(MappedRegion),
    /// `device` is the adapter's descriptor, `shared` the duplicate handed
    /// to consumers.
    Exported { device: DmaHandle, shared: DmaHandle },
    /// `handle` is our duplicate of the downstream descriptor.
    Imported { handle: DmaHandle, origin: ImportedBuffer },
}

impl BackingMemory {
    pub fn mode(&self) -> AllocationMode {
        match self {
            BackingMemory::Pinned(_) => AllocationMode::SelfAllocated,
            BackingMemory::Mapped(_) => AllocationMode::DeviceMapped,
            BackingMemory::Exported { .. } => AllocationMode::DeviceExported,
            BackingMemory::Imported { .. } => AllocationMode::DownstreamImported,
        }
    }

    /// Descriptor a consumer may use to access the memory, if any.
    pub fn descriptor(&self) -> Option<RawDescriptor> {
        match self {
            BackingMemory::Exported { shared, .. } => Some(shared.raw()),
            BackingMemory::Imported { handle, .. } => Some(handle.raw()),
            _ => None,
        }
    }

    /// CPU address, for memory mapped into this process.
    pub fn address(&self) -> Option<usize> {
        match self {
            BackingMemory::Pinned(mem) => Some(mem.address()),
            BackingMemory::Mapped(region) => Some(region.address()),
            _ => None,
        }
    }

    pub fn as_slice(&self) -> Option<&[u8]> {
        match self {
            BackingMemory::Pinned(mem) => Some(mem.as_slice()),
            BackingMemory::Mapped(region) => Some(region.as_slice()),
            _ => None,
        }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            BackingMemory::Pinned(mem) => Some(mem.as_mut_slice()),
            BackingMemory::Mapped(region) => Some(region.as_mut_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct CountingOps {
        open: Mutex<HashSet<RawDescriptor>>,
        next: Mutex<RawDescriptor>,
    }

    impl CountingOps {
        fn open_one(self: &Arc<Self>) -> DmaHandle {
            let mut next = self.next.lock();
            *next += 1;
            self.open.lock().insert(*next);
            DmaHandle::from_raw(*next, 64, self.clone())
        }
    }

    impl DescriptorOps for CountingOps {
        fn duplicate(&self, raw: RawDescriptor) -> io::Result<RawDescriptor> {
            if !self.open.lock().contains(&raw) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let mut next = self.next.lock();
            *next += 1;
            self.open.lock().insert(*next);
            Ok(*next)
        }

        fn close(&self, raw: RawDescriptor) -> io::Result<()> {
            if self.open.lock().remove(&raw) {
                Ok(())
            } else {
                Err(io::Error::from(io::ErrorKind::NotFound))
            }
        }
    }

    #[test]
    fn pinned_memory_is_page_aligned() {
        let mut mem = PinnedMemory::allocate(10_000).unwrap();
        assert_eq!(mem.address() % page_size(), 0);
        assert_eq!(mem.len(), 10_000);
        mem.as_mut_slice()[9_999] = 0xAB;
        assert_eq!(mem.as_slice()[9_999], 0xAB);
    }

    #[test]
    fn pinned_memory_rejects_zero_size() {
        assert!(matches!(
            PinnedMemory::allocate(0),
            Err(CaptureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn duplicate_and_close_are_explicit() {
        let ops = Arc::new(CountingOps::default());
        let handle = ops.open_one();
        let dup = handle.duplicate().unwrap();
        assert_ne!(handle.raw(), dup.raw());
        assert_eq!(ops.open.lock().len(), 2);

        handle.close().unwrap();
        assert_eq!(ops.open.lock().len(), 1);
        dup.close().unwrap();
        assert!(ops.open.lock().is_empty());
    }

    #[test]
    fn dropped_handle_is_closed() {
        let ops = Arc::new(CountingOps::default());
        {
            let _handle = ops.open_one();
            assert_eq!(ops.open.lock().len(), 1);
        }
        assert!(ops.open.lock().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn posix_descriptors_duplicate_real_files() {
        use std::os::unix::io::IntoRawFd;

        let file = tempfile::tempfile().unwrap();
        let raw = file.into_raw_fd();
        let handle = DmaHandle::from_raw(raw, 0, PosixDescriptors::shared());
        let dup = handle.duplicate().unwrap();
        assert_ne!(dup.raw(), handle.raw());
        dup.close().unwrap();
        handle.close().unwrap();
    }
}
