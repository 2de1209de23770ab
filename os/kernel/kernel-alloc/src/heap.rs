//! # Kernel Heap
//!
//! A K&R style free-list allocator over kernel virtual memory.
//!
//! Every block starts with a one-unit [`Header`] holding its length and a
//! link word. Free blocks form a circular ring through that link, sorted by
//! address, with a single wrap from the highest block back to the lowest. A
//! *rover* remembers where the last allocation or free happened; the next
//! search starts there.
//!
//! ```text
//!            rover
//!              v
//!   [0x1000 +2]-->[0x3000 +8]-->[0x9000 +1]--+
//!        ^                                   |
//!        +-----------------------------------+
//! ```
//!
//! A live block keeps a check word derived from its own address in the link
//! slot, which is how [`KernelHeap::free`] tells its own pointers from
//! anything else. Headers are read and written through [`HeapMemory`], so the
//! heap itself holds no per-block state and the number of blocks is bounded
//! only by memory.
//!
//! Sizes are kept in units of [`KERNEL_HEAP_UNIT`] bytes. Requests are carved
//! from the *tail* of the first block that fits.

use kernel_info::memory::{KERNEL_HEAP_MIN_EXPANSION_UNITS, KERNEL_HEAP_UNIT};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::align_down;

const UNIT: u32 = KERNEL_HEAP_UNIT;

/// Bytes in front of every payload.
pub const HEADER_BYTES: u32 = UNIT;

const LIVE_TAG: u32 = 0xA110_C8ED;

const fn live_tag(at: VirtualAddress) -> u32 {
    LIVE_TAG ^ at.as_u32()
}

/// In-band block header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    /// Block length in units, header included.
    pub units: u32,
    /// Free blocks: address of the next free block. Live blocks: check word.
    pub link: u32,
}

impl Header {
    const CLEARED: Self = Self { units: 0, link: 0 };
}

/// Access to the headers inside heap memory.
pub trait HeapMemory {
    /// The header at `at`, or `None` if nothing is mapped there.
    fn read_header(&self, at: VirtualAddress) -> Option<Header>;

    /// Store `header` at `at`. The heap only writes inside memory it was given.
    fn write_header(&mut self, at: VirtualAddress, header: Header);
}

/// Source of fresh heap memory.
pub trait HeapBacking: HeapMemory {
    /// Provide at least `min_bytes` of new, mapped kernel memory.
    ///
    /// Returns the base and the actual length, which is a multiple of
    /// [`KERNEL_HEAP_UNIT`].
    fn grow(&mut self, min_bytes: u32) -> Option<(VirtualAddress, u32)>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("{0:?} was not returned by the heap")]
    UnknownPointer(VirtualAddress),
    #[error("{0:?} is already free")]
    DoubleFree(VirtualAddress),
    #[error("{0:?} overlaps memory the heap already manages")]
    Overlap(VirtualAddress),
    #[error("heap region at {0:?} is not unit aligned")]
    Misaligned(VirtualAddress),
}

/// A run of heap memory, `units` × [`KERNEL_HEAP_UNIT`] bytes at `addr`,
/// header included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Block {
    pub addr: VirtualAddress,
    pub units: u32,
}

impl Block {
    const EMPTY: Self = Self {
        addr: VirtualAddress::zero(),
        units: 0,
    };

    #[must_use]
    pub const fn bytes(&self) -> u32 {
        self.units * UNIT
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.addr.as_u32() + self.bytes()
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.addr.as_u32() && va.as_u32() < self.end()
    }
}

/// Snapshot of the heap's bookkeeping. Byte counts include headers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes handed to the heap through `init` and growth.
    pub committed: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub free_blocks: usize,
    pub live_allocations: usize,
}

#[derive(Debug, Default)]
pub struct KernelHeap {
    rover: Option<VirtualAddress>,
    committed: u32,
    used_bytes: u32,
    free_count: usize,
    live: usize,
}

impl KernelHeap {
    /// An empty heap; every allocation asks the backing first.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rover: None,
            committed: 0,
            used_bytes: 0,
            free_count: 0,
            live: 0,
        }
    }

    /// Hand `[start, start + size)` to the heap.
    ///
    /// `size` is rounded down to whole units.
    ///
    /// # Errors
    /// - [`HeapError::Misaligned`] if `start` is not unit aligned.
    /// - [`HeapError::Overlap`] if the range overlaps a free block.
    pub fn init<H: HeapMemory + ?Sized>(
        &mut self,
        mem: &mut H,
        start: VirtualAddress,
        size: u32,
    ) -> Result<(), HeapError> {
        if !start.as_u32().is_multiple_of(UNIT) {
            return Err(HeapError::Misaligned(start));
        }
        let units = size / UNIT;
        if units == 0 {
            return Ok(());
        }
        if start.checked_add(units * UNIT - 1).is_none() {
            return Err(HeapError::Overlap(start));
        }
        self.insert_free(mem, Block { addr: start, units })?;
        self.committed += units * UNIT;
        log::debug!("heap: added {start:?} ({} bytes)", units * UNIT);
        Ok(())
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Alignments below [`KERNEL_HEAP_UNIT`] are raised to it. When no free
    /// block fits, the heap asks `backing` for at least
    /// [`KERNEL_HEAP_MIN_EXPANSION_UNITS`] units and retries once.
    ///
    /// Returns `None` for `size == 0`, a non-power-of-two `align` or
    /// exhausted backing. The ring is unchanged in that case.
    pub fn alloc<B: HeapBacking + ?Sized>(
        &mut self,
        backing: &mut B,
        size: u32,
        align: u32,
    ) -> Option<VirtualAddress> {
        if size == 0 {
            return None;
        }
        if !align.is_power_of_two() {
            log::warn!("heap: alignment {align} is not a power of two");
            return None;
        }
        let align = align.max(UNIT);
        let payload = size.checked_next_multiple_of(UNIT)?;
        payload.checked_add(HEADER_BYTES)?;

        if let Some(va) = self.carve(backing, payload, align) {
            return Some(va);
        }

        let want = (payload / UNIT + 1)
            .max(KERNEL_HEAP_MIN_EXPANSION_UNITS)
            .checked_mul(UNIT)?
            .checked_add(align - UNIT)?;
        let Some((va, len)) = backing.grow(want) else {
            log::warn!("heap: cannot grow by {want} bytes");
            return None;
        };
        if let Err(e) = self.init(backing, va, len) {
            log::error!("heap: growth at {va:?} rejected: {e}");
            return None;
        }
        self.carve(backing, payload, align)
    }

    /// Return an allocation to the ring, merging it with adjacent free blocks.
    ///
    /// # Errors
    /// [`HeapError::DoubleFree`] if `va` lies in a free block,
    /// [`HeapError::UnknownPointer`] for anything else the heap did not
    /// hand out, [`HeapError::Overlap`] if the block's header no longer fits
    /// the ring. The heap is unchanged in all cases.
    pub fn free<H: HeapMemory + ?Sized>(
        &mut self,
        mem: &mut H,
        va: VirtualAddress,
    ) -> Result<(), HeapError> {
        let block = self
            .live_block(mem, va)
            .inspect_err(|e| log::warn!("heap: {e}"))?;
        self.insert_free(mem, block)
            .inspect_err(|e| log::error!("heap: freeing {va:?}: {e}"))?;
        self.used_bytes -= block.bytes();
        self.live -= 1;
        Ok(())
    }

    /// Payload size in bytes of the live allocation at `va`.
    #[must_use]
    pub fn allocation_size<H: HeapMemory + ?Sized>(&self, mem: &H, va: VirtualAddress) -> Option<u32> {
        self.live_block(mem, va).ok().map(|b| b.bytes() - HEADER_BYTES)
    }

    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        HeapStats {
            committed: self.committed,
            free_bytes: self.committed - self.used_bytes,
            used_bytes: self.used_bytes,
            free_blocks: self.free_count,
            live_allocations: self.live,
        }
    }

    /// Free blocks in ascending address order.
    pub fn free_blocks<'a, H: HeapMemory + ?Sized>(&self, mem: &'a H) -> FreeBlocks<'a, H> {
        let lowest = self.rover.map(|r| {
            let mut best = r;
            let mut cur = next_of(mem, r);
            while cur != r {
                if cur < best {
                    best = cur;
                }
                cur = next_of(mem, cur);
            }
            best
        });
        FreeBlocks {
            mem,
            start: lowest,
            cursor: lowest,
        }
    }

    /// The live block whose payload starts at `va`.
    fn live_block<H: HeapMemory + ?Sized>(&self, mem: &H, va: VirtualAddress) -> Result<Block, HeapError> {
        if self.free_blocks(mem).any(|b| b.contains(va)) {
            return Err(HeapError::DoubleFree(va));
        }
        let unknown = HeapError::UnknownPointer(va);
        if !va.as_u32().is_multiple_of(UNIT) || va.as_u32() < HEADER_BYTES {
            return Err(unknown);
        }
        let at = VirtualAddress::new(va.as_u32() - HEADER_BYTES);
        match mem.read_header(at) {
            Some(h) if h.link == live_tag(at) && h.units > 1 => Ok(Block { addr: at, units: h.units }),
            _ => Err(unknown),
        }
    }

    fn prev_of<H: HeapMemory + ?Sized>(mem: &H, at: VirtualAddress) -> VirtualAddress {
        let mut cur = at;
        loop {
            let next = next_of(mem, cur);
            if next == at {
                return cur;
            }
            cur = next;
        }
    }

    /// Walk the ring once from the rover and carve `payload` bytes from the
    /// tail of the first block that fits.
    fn carve<H: HeapMemory + ?Sized>(&mut self, mem: &mut H, payload: u32, align: u32) -> Option<VirtualAddress> {
        let start = self.rover?;
        let mut prev = Self::prev_of(mem, start);
        let mut cur = start;
        loop {
            let h = load(mem, cur);
            let block = Block { addr: cur, units: h.units };
            let next = VirtualAddress::new(h.link);
            if let Some(at) = fit(block, payload, align) {
                return Some(self.split(mem, prev, block, next, at, payload));
            }
            prev = cur;
            cur = next;
            if cur == start {
                return None;
            }
        }
    }

    /// Cut the live block with payload `[at, at + payload)` out of free
    /// `block`, leaving up to two free fragments in its place.
    fn split<H: HeapMemory + ?Sized>(
        &mut self,
        mem: &mut H,
        prev: VirtualAddress,
        block: Block,
        next: VirtualAddress,
        at: u32,
        payload: u32,
    ) -> VirtualAddress {
        let header_at = at - HEADER_BYTES;
        let head = Block {
            addr: block.addr,
            units: (header_at - block.addr.as_u32()) / UNIT,
        };
        let tail = Block {
            addr: VirtualAddress::new(at + payload),
            units: (block.end() - (at + payload)) / UNIT,
        };
        let alone = next == block.addr;

        let mut pieces = [Block::EMPTY; 2];
        let mut count = 0;
        for b in [head, tail] {
            if b.units > 0 {
                pieces[count] = b;
                count += 1;
            }
        }
        let pieces = &pieces[..count];

        if let (Some(first), Some(last)) = (pieces.first(), pieces.last()) {
            for pair in pieces.windows(2) {
                let link = pair[1].addr.as_u32();
                mem.write_header(pair[0].addr, Header { units: pair[0].units, link });
            }
            let outside = if alone { first.addr } else { next };
            mem.write_header(last.addr, Header { units: last.units, link: outside.as_u32() });
            if !alone {
                set_link(mem, prev, first.addr);
            }
            self.rover = Some(first.addr);
        } else if alone {
            self.rover = None;
        } else {
            set_link(mem, prev, next);
            self.rover = Some(prev);
        }
        self.free_count = self.free_count - 1 + count;

        let used = Block {
            addr: VirtualAddress::new(header_at),
            units: payload / UNIT + 1,
        };
        mem.write_header(used.addr, Header { units: used.units, link: live_tag(used.addr) });
        self.used_bytes += used.bytes();
        self.live += 1;
        VirtualAddress::new(at)
    }

    /// Link `block` into the ring at its address position, merging with
    /// neighbours that touch it. Nothing is written unless it succeeds.
    fn insert_free<H: HeapMemory + ?Sized>(&mut self, mem: &mut H, block: Block) -> Result<(), HeapError> {
        let Some(start) = self.rover else {
            mem.write_header(block.addr, Header { units: block.units, link: block.addr.as_u32() });
            self.rover = Some(block.addr);
            self.free_count = 1;
            return Ok(());
        };

        let addr = block.addr.as_u32();
        let mut p = start;
        let (pb, nb) = loop {
            let ph = load(mem, p);
            let n = VirtualAddress::new(ph.link);
            let between = p.as_u32() < addr && addr < n.as_u32();
            let wraps = p >= n && (addr > p.as_u32() || addr < n.as_u32());
            if between || wraps {
                let nb = Block { addr: n, units: load(mem, n).units };
                break (Block { addr: p, units: ph.units }, nb);
            }
            p = n;
            if p == start {
                return Err(HeapError::Overlap(block.addr));
            }
        };

        let overlaps = |other: Block| other.addr.as_u32() < block.end() && addr < other.end();
        if overlaps(pb) || overlaps(nb) {
            return Err(HeapError::Overlap(block.addr));
        }

        let n = nb.addr;
        let alone = p == n;
        let after_n = next_of(mem, n);
        let touches_prev = pb.end() == addr;
        let touches_next = block.end() == n.as_u32();

        let absorber = if touches_prev && touches_next && !alone {
            let units = pb.units + block.units + nb.units;
            mem.write_header(p, Header { units, link: after_n.as_u32() });
            mem.write_header(n, Header::CLEARED);
            mem.write_header(block.addr, Header::CLEARED);
            self.free_count -= 1;
            p
        } else if touches_next {
            let link = if alone { block.addr } else { after_n };
            let units = block.units + nb.units;
            mem.write_header(block.addr, Header { units, link: link.as_u32() });
            mem.write_header(n, Header::CLEARED);
            if !alone {
                set_link(mem, p, block.addr);
            }
            block.addr
        } else if touches_prev {
            let units = pb.units + block.units;
            mem.write_header(p, Header { units, link: n.as_u32() });
            mem.write_header(block.addr, Header::CLEARED);
            p
        } else {
            mem.write_header(block.addr, Header { units: block.units, link: n.as_u32() });
            set_link(mem, p, block.addr);
            self.free_count += 1;
            block.addr
        };
        self.rover = Some(absorber);
        Ok(())
    }
}

/// Payload address for `payload` bytes at the tail of `block`, if it fits
/// together with its header.
fn fit(block: Block, payload: u32, align: u32) -> Option<u32> {
    let at = align_down(block.end() - block.bytes().min(payload), align);
    (block.bytes() >= payload && at >= block.addr.as_u32() + HEADER_BYTES).then_some(at)
}

fn load<H: HeapMemory + ?Sized>(mem: &H, at: VirtualAddress) -> Header {
    let Some(h) = mem.read_header(at) else {
        panic!("heap ring corrupted: no header at {at:?}");
    };
    h
}

fn next_of<H: HeapMemory + ?Sized>(mem: &H, at: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(load(mem, at).link)
}

fn set_link<H: HeapMemory + ?Sized>(mem: &mut H, at: VirtualAddress, link: VirtualAddress) {
    let h = load(mem, at);
    mem.write_header(at, Header { link: link.as_u32(), ..h });
}

/// Iterator over the free ring, see [`KernelHeap::free_blocks`].
pub struct FreeBlocks<'a, H: HeapMemory + ?Sized> {
    mem: &'a H,
    start: Option<VirtualAddress>,
    cursor: Option<VirtualAddress>,
}

impl<H: HeapMemory + ?Sized> Iterator for FreeBlocks<'_, H> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let cur = self.cursor?;
        let h = load(self.mem, cur);
        let next = VirtualAddress::new(h.link);
        self.cursor = if Some(next) == self.start {
            None
        } else {
            Some(next)
        };
        Some(Block {
            addr: cur,
            units: h.units,
        })
    }
}
