//! Size-classed shared buffer pools.
//!
//! A pool owns one [`SharedRegion`] for its whole lifetime and hands out
//! fixed-size buffers from it. Each domain reaches the memory through its
//! own cache mirror: loads and stores hit the mirror, and only
//! [`SharedBufferPool::writeback`] / [`SharedBufferPool::invalidate`] move
//! cache lines between the mirror and the shared memory. A producer that
//! forgets to write back, or a consumer that forgets to invalidate, observes
//! stale data exactly as it would on hardware with incoherent caches.
//!
//! [`BufferGuard`] packages the required ordering: acquiring a buffer
//! invalidates it for the acquiring side, and releasing (or dropping) the
//! guard writes it back before ownership moves to the peer.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::ids::PoolId;
use crate::region::SharedRegion;
use crate::{TransportError, TransportResult};

/// Alignment applied to every buffer size class.
pub const BUF_ALIGN: usize = 128;

/// Granularity of writeback/invalidate operations.
pub const CACHE_LINE: usize = 128;

/// Base of the co-processor's view of a pool unless configured otherwise.
pub const DEFAULT_REMOTE_BASE: u32 = 0x8FC0_0000;

/// Rounds `len` up to the next multiple of `align`.
pub fn align_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

/// The two domains sharing a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Gpp,
    Dsp,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Gpp => 0,
            Side::Dsp => 1,
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Gpp => Side::Dsp,
            Side::Dsp => Side::Gpp,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Gpp => f.write_str("gpp"),
            Side::Dsp => f.write_str("dsp"),
        }
    }
}

/// A group of equally sized buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub size: usize,
    pub count: u32,
}

/// Attributes fixed when a pool is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAttrs {
    pub classes: Vec<SizeClass>,
    /// When set, allocations must name a configured size exactly.
    pub exact_match: bool,
    /// First address of the pool in the co-processor's address space.
    pub remote_base: u32,
}

impl PoolAttrs {
    /// One size class of `count` buffers, exact matching enabled.
    pub fn single(size: usize, count: u32) -> Self {
        Self {
            classes: vec![SizeClass { size, count }],
            exact_match: true,
            remote_base: DEFAULT_REMOTE_BASE,
        }
    }

    pub fn with_class(mut self, size: usize, count: u32) -> Self {
        self.classes.push(SizeClass { size, count });
        self
    }

    pub fn exact_match(mut self, exact: bool) -> Self {
        self.exact_match = exact;
        self
    }

    pub fn remote_base(mut self, base: u32) -> Self {
        self.remote_base = base;
        self
    }
}

/// An address inside a pool, tagged with the address space it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolAddr {
    /// Address in the allocating (host) domain.
    Local(usize),
    /// Address in the co-processor's view.
    Remote(u32),
}

impl PoolAddr {
    fn raw(self) -> u64 {
        match self {
            PoolAddr::Local(addr) => addr as u64,
            PoolAddr::Remote(addr) => addr as u64,
        }
    }
}

/// Descriptor of one allocation drawn from a pool.
///
/// The descriptor is plain data; liveness and ownership are tracked by the
/// pool, so both domains can hold a copy that names the same memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    pool: PoolId,
    offset: usize,
    len: usize,
    local: usize,
    remote: u32,
}

impl Buffer {
    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    /// Byte offset of the buffer from the start of the pool.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn local_addr(&self) -> PoolAddr {
        PoolAddr::Local(self.local)
    }

    pub fn remote_addr(&self) -> PoolAddr {
        PoolAddr::Remote(self.remote)
    }

    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Free,
    Live { owner: Side },
}

#[derive(Debug)]
struct ClassState {
    size: usize,
    base: usize,
    slots: Vec<Slot>,
}

impl ClassState {
    fn slot_of(&self, offset: usize) -> Option<usize> {
        let end = self.base + self.size * self.slots.len();
        if offset < self.base || offset >= end || (offset - self.base) % self.size != 0 {
            return None;
        }
        Some((offset - self.base) / self.size)
    }
}

#[derive(Debug)]
struct Ledger {
    classes: Vec<ClassState>,
    closed: bool,
}

impl Ledger {
    fn slot_mut(&mut self, offset: usize) -> Option<(&mut Slot, usize)> {
        for class in self.classes.iter_mut() {
            if let Some(idx) = class.slot_of(offset) {
                let size = class.size;
                return Some((&mut class.slots[idx], size));
            }
        }
        None
    }

    fn outstanding(&self) -> usize {
        self.classes
            .iter()
            .flat_map(|class| class.slots.iter())
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }
}

/// Buffer pool shared by the host and one co-processor.
pub struct SharedBufferPool {
    id: PoolId,
    exact_match: bool,
    len: usize,
    local_base: usize,
    remote_base: u32,
    memory: Mutex<Option<SharedRegion>>,
    caches: [Mutex<Vec<u8>>; 2],
    ledger: Mutex<Ledger>,
}

impl fmt::Debug for SharedBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBufferPool")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("exact_match", &self.exact_match)
            .field("remote_base", &format_args!("{:#x}", self.remote_base))
            .finish()
    }
}

impl SharedBufferPool {
    fn open(id: PoolId, attrs: &PoolAttrs) -> TransportResult<Self> {
        if attrs.classes.is_empty() {
            return Err(TransportError::InvalidAttrs(
                "at least one size class is required",
            ));
        }

        let mut classes = Vec::with_capacity(attrs.classes.len());
        let mut len = 0usize;
        for class in &attrs.classes {
            if class.size == 0 || class.count == 0 {
                return Err(TransportError::InvalidAttrs(
                    "size classes need a non-zero size and count",
                ));
            }
            let size = align_up(class.size, BUF_ALIGN);
            let bytes = size
                .checked_mul(class.count as usize)
                .ok_or(TransportError::InvalidAttrs("pool size overflows"))?;
            classes.push(ClassState {
                size,
                base: len,
                slots: vec![Slot::Free; class.count as usize],
            });
            len = len
                .checked_add(bytes)
                .ok_or(TransportError::InvalidAttrs("pool size overflows"))?;
        }

        if len > (u32::MAX - attrs.remote_base) as usize {
            return Err(TransportError::InvalidAttrs(
                "pool does not fit the remote address window",
            ));
        }

        let region = SharedRegion::zeroed(len, BUF_ALIGN.max(4096))?;
        let local_base = region.base_addr();
        tracing::debug!(
            pool = %id,
            bytes = len,
            classes = classes.len(),
            exact_match = attrs.exact_match,
            "pool opened"
        );

        Ok(Self {
            id,
            exact_match: attrs.exact_match,
            len,
            local_base,
            remote_base: attrs.remote_base,
            memory: Mutex::new(Some(region)),
            caches: [Mutex::new(vec![0; len]), Mutex::new(vec![0; len])],
            ledger: Mutex::new(Ledger {
                classes,
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Total bytes of shared memory backing the pool.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buffers currently allocated.
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().outstanding()
    }

    /// Draws a buffer of `size` bytes; `owner` holds it first.
    ///
    /// With exact matching, `size` rounded up to [`BUF_ALIGN`] must equal a
    /// configured class size. Otherwise the smallest class that fits and has
    /// a free buffer is used.
    pub fn allocate(&self, owner: Side, size: usize) -> TransportResult<Buffer> {
        let mut ledger = self.ledger.lock();
        if ledger.closed {
            return Err(TransportError::PoolClosed(self.id));
        }

        let exact = self.exact_match;
        let aligned = align_up(size, BUF_ALIGN);
        let mut candidates: Vec<usize> = ledger
            .classes
            .iter()
            .enumerate()
            .filter(|(_, class)| {
                if exact {
                    size > 0 && class.size == aligned
                } else {
                    size > 0 && class.size >= size
                }
            })
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|&idx| ledger.classes[idx].size);

        let Some(&smallest) = candidates.first() else {
            return Err(TransportError::NoMatchingSizeClass { requested: size });
        };

        for idx in candidates {
            let class = &mut ledger.classes[idx];
            if let Some(slot) = class.slots.iter().position(|s| *s == Slot::Free) {
                class.slots[slot] = Slot::Live { owner };
                let offset = class.base + slot * class.size;
                let buffer = self.describe(offset, class.size);
                tracing::debug!(pool = %self.id, offset, len = class.size, %owner, "buffer allocated");
                return Ok(buffer);
            }
        }

        Err(TransportError::OutOfMemory {
            size: ledger.classes[smallest].size,
        })
    }

    /// Returns a buffer to its size class.
    pub fn free(&self, buffer: &Buffer) -> TransportResult<()> {
        let mut ledger = self.ledger.lock();
        match ledger.slot_mut(buffer.offset) {
            Some((slot, _)) if matches!(slot, Slot::Live { .. }) => {
                *slot = Slot::Free;
                tracing::debug!(pool = %self.id, offset = buffer.offset, "buffer freed");
                Ok(())
            }
            _ => Err(TransportError::NotAllocated {
                pool: self.id,
                offset: buffer.offset,
            }),
        }
    }

    /// Resolves an address received from the peer into a live buffer.
    pub fn buffer_at(&self, addr: PoolAddr, len: usize) -> TransportResult<Buffer> {
        let offset = self.offset_of(addr, len)?;
        let mut ledger = self.ledger.lock();
        match ledger.slot_mut(offset) {
            Some((Slot::Live { .. }, size)) if len <= size => Ok(self.describe(offset, len)),
            _ => Err(TransportError::NotAllocated {
                pool: self.id,
                offset,
            }),
        }
    }

    /// Maps an address into the other domain's view of the pool.
    pub fn translate(&self, addr: PoolAddr) -> TransportResult<PoolAddr> {
        if self.ledger.lock().closed {
            return Err(TransportError::PoolClosed(self.id));
        }
        let offset = self.offset_of(addr, 1)?;
        Ok(match addr {
            PoolAddr::Local(_) => PoolAddr::Remote(self.remote_base + offset as u32),
            PoolAddr::Remote(_) => PoolAddr::Local(self.local_base + offset),
        })
    }

    /// Copies the cache lines covering `[addr, addr + len)` from `side`'s
    /// cache into shared memory.
    pub fn writeback(&self, side: Side, addr: PoolAddr, len: usize) -> TransportResult<()> {
        let range = self.line_range(self.offset_of(addr, len)?, len);
        let cache = self.caches[side.index()].lock();
        self.flush_lines(&cache, range)
    }

    /// Discards `side`'s cached copy of `[addr, addr + len)` so the next
    /// load observes shared memory.
    pub fn invalidate(&self, side: Side, addr: PoolAddr, len: usize) -> TransportResult<()> {
        let range = self.line_range(self.offset_of(addr, len)?, len);
        let mut cache = self.caches[side.index()].lock();
        self.fill_lines(&mut cache, range)
    }

    /// Loads bytes through `side`'s cache without any maintenance.
    pub fn read_cached(&self, side: Side, addr: PoolAddr, dst: &mut [u8]) -> TransportResult<()> {
        let offset = self.offset_of(addr, dst.len())?;
        let cache = self.caches[side.index()].lock();
        dst.copy_from_slice(&cache[offset..offset + dst.len()]);
        Ok(())
    }

    /// Stores bytes into `side`'s cache without any maintenance.
    pub fn write_cached(&self, side: Side, addr: PoolAddr, src: &[u8]) -> TransportResult<()> {
        let offset = self.offset_of(addr, src.len())?;
        let mut cache = self.caches[side.index()].lock();
        cache[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Takes `side`'s view of a buffer it currently owns.
    ///
    /// The buffer is invalidated before the guard is handed out.
    pub fn acquire(&self, side: Side, buffer: &Buffer) -> TransportResult<BufferGuard<'_>> {
        self.check_owner(side, buffer)?;
        let mut cache = self.caches[side.index()].lock();
        self.fill_lines(&mut cache, self.line_range(buffer.offset, buffer.len))?;
        Ok(BufferGuard {
            pool: self,
            side,
            buffer: *buffer,
            cache,
            released: false,
        })
    }

    /// Current owner of a live buffer.
    pub fn owner(&self, buffer: &Buffer) -> TransportResult<Side> {
        let mut ledger = self.ledger.lock();
        match ledger.slot_mut(buffer.offset) {
            Some((Slot::Live { owner }, _)) => Ok(*owner),
            _ => Err(TransportError::NotAllocated {
                pool: self.id,
                offset: buffer.offset,
            }),
        }
    }

    fn check_owner(&self, side: Side, buffer: &Buffer) -> TransportResult<()> {
        let owner = self.owner(buffer)?;
        if owner != side {
            return Err(TransportError::NotOwner {
                owner,
                requester: side,
            });
        }
        Ok(())
    }

    fn set_owner(&self, buffer: &Buffer, next: Side) -> TransportResult<()> {
        let mut ledger = self.ledger.lock();
        match ledger.slot_mut(buffer.offset) {
            Some((Slot::Live { owner }, _)) => {
                *owner = next;
                Ok(())
            }
            _ => Err(TransportError::NotAllocated {
                pool: self.id,
                offset: buffer.offset,
            }),
        }
    }

    fn close(&self) -> TransportResult<()> {
        {
            let mut ledger = self.ledger.lock();
            if ledger.closed {
                return Err(TransportError::PoolClosed(self.id));
            }
            let outstanding = ledger.outstanding();
            if outstanding > 0 {
                return Err(TransportError::PoolBusy {
                    pool: self.id,
                    outstanding,
                });
            }
            ledger.closed = true;
        }

        let region = self.memory.lock().take();
        for cache in &self.caches {
            let mut cache = cache.lock();
            cache.clear();
            cache.shrink_to_fit();
        }
        drop(region);
        tracing::debug!(pool = %self.id, "pool closed");
        Ok(())
    }

    fn describe(&self, offset: usize, len: usize) -> Buffer {
        Buffer {
            pool: self.id,
            offset,
            len,
            local: self.local_base + offset,
            remote: self.remote_base + offset as u32,
        }
    }

    fn offset_of(&self, addr: PoolAddr, len: usize) -> TransportResult<usize> {
        let start = match addr {
            PoolAddr::Local(local) => local.checked_sub(self.local_base),
            PoolAddr::Remote(remote) => remote
                .checked_sub(self.remote_base)
                .map(|offset| offset as usize),
        };
        match start {
            Some(offset) if offset < self.len && len <= self.len - offset => Ok(offset),
            _ => Err(TransportError::NotInPool {
                pool: self.id,
                addr: addr.raw(),
                len,
            }),
        }
    }

    fn line_range(&self, offset: usize, len: usize) -> Range<usize> {
        let start = offset / CACHE_LINE * CACHE_LINE;
        let end = align_up(offset + len, CACHE_LINE).min(self.len);
        start..end
    }

    fn flush_lines(&self, cache: &[u8], range: Range<usize>) -> TransportResult<()> {
        let mut memory = self.memory.lock();
        let region = memory.as_mut().ok_or(TransportError::PoolClosed(self.id))?;
        region.as_mut_slice()[range.clone()].copy_from_slice(&cache[range]);
        Ok(())
    }

    fn fill_lines(&self, cache: &mut [u8], range: Range<usize>) -> TransportResult<()> {
        let memory = self.memory.lock();
        let region = memory.as_ref().ok_or(TransportError::PoolClosed(self.id))?;
        cache[range.clone()].copy_from_slice(&region.as_slice()[range]);
        Ok(())
    }
}

/// Scoped, exclusive view of a buffer from one side.
///
/// Dereferences to the side's cached copy of the buffer. Dropping the guard
/// writes the buffer back but keeps ownership; [`BufferGuard::release_to`]
/// writes back and then hands ownership to the peer.
pub struct BufferGuard<'a> {
    pool: &'a SharedBufferPool,
    side: Side,
    buffer: Buffer,
    cache: MutexGuard<'a, Vec<u8>>,
    released: bool,
}

impl BufferGuard<'_> {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Writes the buffer back and transfers ownership to `next`.
    pub fn release_to(mut self, next: Side) -> TransportResult<()> {
        self.write_back()?;
        self.released = true;
        self.pool.set_owner(&self.buffer, next)?;
        tracing::trace!(pool = %self.pool.id, from = %self.side, to = %next, "buffer handed over");
        Ok(())
    }

    fn write_back(&self) -> TransportResult<()> {
        let range = self.pool.line_range(self.buffer.offset, self.buffer.len);
        self.pool.flush_lines(&self.cache, range)
    }
}

impl Deref for BufferGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.cache[self.buffer.range()]
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let range = self.buffer.range();
        &mut self.cache[range]
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.write_back() {
            tracing::warn!(pool = %self.pool.id, side = %self.side, "writeback on drop failed: {err}");
        }
    }
}

/// Pools indexed by (processor, pool id), shared by both domains.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolId, Arc<SharedBufferPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the pool and its backing memory.
    pub fn open(&self, id: PoolId, attrs: &PoolAttrs) -> TransportResult<Arc<SharedBufferPool>> {
        let mut pools = self.pools.lock();
        if pools.contains_key(&id) {
            return Err(TransportError::PoolAlreadyOpen(id));
        }
        let pool = Arc::new(SharedBufferPool::open(id, attrs)?);
        pools.insert(id, Arc::clone(&pool));
        Ok(pool)
    }

    /// Looks up a pool opened by the other domain.
    pub fn attach(&self, id: PoolId) -> TransportResult<Arc<SharedBufferPool>> {
        self.pools
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TransportError::PoolNotOpen(id))
    }

    /// Releases the backing memory. Fails while buffers are outstanding.
    pub fn close(&self, id: PoolId) -> TransportResult<()> {
        let mut pools = self.pools.lock();
        let pool = pools.get(&id).ok_or(TransportError::PoolNotOpen(id))?;
        pool.close()?;
        pools.remove(&id);
        Ok(())
    }
}
