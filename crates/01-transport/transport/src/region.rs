//! Backing memory for buffer pools.
//!
//! A pool is carved out of one physically contiguous region that both
//! domains can see. Native builds prefer an anonymous `mmap` (page aligned)
//! and fall back to an aligned heap allocation when the mapping does not
//! satisfy the requested alignment. The region is always zeroed.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::MmapMut),
    Owned { ptr: NonNull<u8>, layout: Layout },
}

impl Backing {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }

    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::Mapped(map) => map.as_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Zeroed, aligned memory shared by both domains of a link.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region exclusively owns its allocation; every access goes
// through `&self`/`&mut self`, so moving it to another thread is sound.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    pub fn zeroed(len: usize, alignment: usize) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        if let Some(backing) = Self::mapped(len, alignment)? {
            return Ok(Self {
                len,
                alignment,
                backing,
            });
        }

        Self::heap(len, alignment)
    }

    fn heap(len: usize, alignment: usize) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        // SAFETY: `layout` has a non-zero size, checked in `zeroed`.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Owned { ptr, layout },
        })
    }

    fn mapped(len: usize, alignment: usize) -> TransportResult<Option<Backing>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        // SAFETY: the anonymous mapping exposes `len` writable bytes.
        unsafe { ptr::write_bytes(ptr, 0, len) };
        Ok(Some(Backing::Mapped(map)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Address of the first byte, as seen by the allocating domain.
    pub fn base_addr(&self) -> usize {
        self.backing.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backing holds `len` initialised bytes for our lifetime.
        unsafe { std::slice::from_raw_parts(self.backing.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.backing.as_mut_ptr(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: `ptr` was returned by `alloc_zeroed` with this `layout`.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zeroed_and_aligned() {
        let region = SharedRegion::zeroed(4096 + 128, 128).expect("region");
        assert_eq!(region.len(), 4096 + 128);
        assert_eq!(region.base_addr() % 128, 0);
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_alignment_and_empty_regions() {
        assert!(matches!(
            SharedRegion::zeroed(64, 48),
            Err(TransportError::AllocationFailed { alignment: 48, .. })
        ));
        assert!(SharedRegion::zeroed(0, 64).is_err());
    }

    #[test]
    fn heap_fallback_honours_large_alignment() {
        let mut region = SharedRegion::heap(256, 1 << 16).expect("heap region");
        assert_eq!(region.base_addr() % (1 << 16), 0);
        region.as_mut_slice()[255] = 7;
        assert_eq!(region.as_slice()[255], 7);
    }
}
