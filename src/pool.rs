//! Reference-counted frame arena.
//!
//! Frames live in slots of a single arena and are addressed by [`FrameId`]s
//! that carry the slot's generation. A slot is reclaimed exactly once, when
//! its reference count drops to zero; reclaiming bumps the generation so any
//! handle still floating around is rejected with [`Error::StaleFrame`]
//! instead of silently touching a recycled frame.
//!
//! Most code never touches ids directly and uses [`FrameRef`], an RAII
//! reference: cloning adds a reference, dropping releases one.
//!
//! # Reclaim order
//!
//! When the count reaches zero the slot's "returned-to-pool" hook runs first,
//! then the buffer disposal, and only then is the slot pushed back onto the
//! free list. Both hooks run after the pool lock is dropped, so they may take
//! other locks (the per-stream allocator does).

use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::warn;

use crate::{frames::FrameData, Error, Result};

/// Hook run once when a frame's last reference is released.
pub(crate) type ReturnHook = Box<dyn FnOnce(FrameId) + Send>;

/// Releases a raw frame buffer back to whoever allocated it.
pub type FreeBufferFn = Arc<dyn Fn(Box<[u8]>) + Send + Sync>;

/// What happens to a frame's buffer when the frame is reclaimed.
#[derive(Clone, Default)]
pub(crate) enum BufferDisposal {
    /// Hand the buffer back to the stream's default pool.
    Recycle(FreeBufferFn),
    /// Hand the buffer to a user-installed allocator.
    Custom(FreeBufferFn),
    /// Free the buffer unconditionally.
    #[default]
    Discard,
}

impl BufferDisposal {
    fn dispose(self, buffer: Box<[u8]>) {
        match self {
            BufferDisposal::Recycle(free) | BufferDisposal::Custom(free) => free(buffer),
            BufferDisposal::Discard => drop(buffer),
        }
    }
}

/// Generation-checked handle to a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: u32,
    generation: u32,
}

impl FrameId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn stale(self) -> Error {
        Error::StaleFrame {
            index: self.index,
            generation: self.generation,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    ref_count: u32,
    data: Option<Arc<FrameData>>,
    on_return: Option<ReturnHook>,
    disposal: BufferDisposal,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn live(&mut self, id: FrameId) -> Result<&mut Slot> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.ref_count > 0 => Ok(slot),
            _ => Err(id.stale()),
        }
    }
}

/// What a slot held when it was reclaimed.
struct Reclaimed {
    data: Option<Arc<FrameData>>,
    on_return: Option<ReturnHook>,
    disposal: BufferDisposal,
}

/// The frame pool shared by every stream of a context.
///
/// Cloning is cheap and yields another handle to the same arena.
#[derive(Clone, Default)]
pub struct FramePool {
    arena: Arc<Mutex<Arena>>,
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.lock();
        f.debug_struct("FramePool")
            .field("slots", &arena.slots.len())
            .field("free", &arena.free.len())
            .finish()
    }
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a slot off the free list (or grows the arena) with a reference
    /// count of one and every field reset.
    ///
    /// Returns `None` only if the arena cannot grow any further.
    pub fn acquire(&self) -> Option<FrameId> {
        let mut arena = self.lock();
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(arena.slots.len()).ok()?;
                arena.slots.try_reserve(1).ok()?;
                arena.slots.push(Slot::default());
                index
            }
        };
        let slot = &mut arena.slots[index as usize];
        slot.ref_count = 1;
        slot.data = None;
        slot.on_return = None;
        slot.disposal = BufferDisposal::Discard;
        Some(FrameId {
            index,
            generation: slot.generation,
        })
    }

    /// Adds a reference to a live frame.
    pub fn add_ref(&self, id: FrameId) -> Result<()> {
        let mut arena = self.lock();
        let slot = arena.live(id)?;
        slot.ref_count += 1;
        Ok(())
    }

    /// Drops a reference. The last release reclaims the slot: the return
    /// hook runs, the buffer is disposed of, and the slot goes back on the
    /// free list.
    pub fn release(&self, id: FrameId) -> Result<()> {
        let reclaimed = {
            let mut arena = self.lock();
            let slot = arena.live(id)?;
            slot.ref_count -= 1;
            if slot.ref_count > 0 {
                return Ok(());
            }
            Reclaimed {
                data: slot.data.take(),
                on_return: slot.on_return.take(),
                disposal: std::mem::take(&mut slot.disposal),
            }
        };

        if let Some(on_return) = reclaimed.on_return {
            on_return(id);
        }
        if let Some(data) = reclaimed.data {
            match Arc::try_unwrap(data) {
                Ok(mut data) => reclaimed.disposal.dispose(data.take_buffer()),
                // Only reachable if a FrameRef outlived its reference, which
                // FrameRef::drop rules out. The buffer is dropped with the Arc.
                Err(_) => warn!(slot = id.index, "frame payload still shared at reclaim"),
            }
        }

        let mut arena = self.lock();
        let slot = &mut arena.slots[id.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(id.index);
        Ok(())
    }

    /// Current reference count, or `None` for a stale id.
    pub fn ref_count(&self, id: FrameId) -> Option<u32> {
        self.lock().live(id).ok().map(|slot| slot.ref_count)
    }

    /// Number of frames currently holding at least one reference.
    pub fn live_frames(&self) -> usize {
        let arena = self.lock();
        arena.slots.len() - arena.free.len()
    }

    /// Installs the hooks that run when `id` is reclaimed.
    pub(crate) fn set_hooks(
        &self,
        id: FrameId,
        on_return: Option<ReturnHook>,
        disposal: BufferDisposal,
    ) -> Result<()> {
        let mut arena = self.lock();
        let slot = arena.live(id)?;
        slot.on_return = on_return;
        slot.disposal = disposal;
        Ok(())
    }

    /// Detaches an in-flight frame from its stream: the return hook is
    /// cleared and a recycling disposal becomes an unconditional free.
    /// Custom disposals are left alone. Stale ids are ignored.
    pub(crate) fn detach(&self, id: FrameId) {
        let mut arena = self.lock();
        if let Ok(slot) = arena.live(id) {
            slot.on_return = None;
            if matches!(slot.disposal, BufferDisposal::Recycle(_)) {
                slot.disposal = BufferDisposal::Discard;
            }
        }
    }

    /// The published payload of a live frame.
    pub(crate) fn payload(&self, id: FrameId) -> Result<Arc<FrameData>> {
        let mut arena = self.lock();
        let slot = arena.live(id)?;
        slot.data
            .clone()
            .ok_or_else(|| Error::BadParameter(format!("frame {} has not been published", id.index)))
    }

    /// Stores the payload of a frame that is being handed off.
    pub(crate) fn publish(&self, id: FrameId, data: FrameData) -> Result<Arc<FrameData>> {
        let mut arena = self.lock();
        let slot = arena.live(id)?;
        let data = Arc::new(data);
        slot.data = Some(Arc::clone(&data));
        Ok(data)
    }
}

/// An owned reference to a published frame.
///
/// Cloning adds a pool reference and dropping releases it, so a frame is
/// reclaimed exactly when the last `FrameRef` goes away. Dereferences to the
/// frame's [`FrameData`].
pub struct FrameRef {
    pool: FramePool,
    id: FrameId,
    data: Option<Arc<FrameData>>,
}

impl FrameRef {
    /// Wraps a reference the caller already owns.
    pub(crate) fn adopt(pool: FramePool, id: FrameId, data: Arc<FrameData>) -> Self {
        Self {
            pool,
            id,
            data: Some(data),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Gives up this handle without releasing its reference.
    ///
    /// The reference must later be released with
    /// [`crate::Context::frame_release`] or re-wrapped with
    /// [`crate::Context::frame_from_raw`].
    pub fn into_raw(mut self) -> FrameId {
        self.data = None;
        self.id
    }

    /// Current reference count of the underlying frame.
    pub fn ref_count(&self) -> u32 {
        self.pool.ref_count(self.id).unwrap_or(0)
    }

    fn payload(&self) -> &FrameData {
        match &self.data {
            Some(data) => data,
            None => unreachable!("FrameRef payload is only taken when the handle is consumed"),
        }
    }
}

impl Deref for FrameRef {
    type Target = FrameData;

    fn deref(&self) -> &FrameData {
        self.payload()
    }
}

impl Clone for FrameRef {
    fn clone(&self) -> Self {
        // A live FrameRef keeps the slot's count above zero, so this cannot
        // observe a stale id.
        if let Err(e) = self.pool.add_ref(self.id) {
            warn!(error = %e, "add_ref on a live FrameRef failed");
        }
        Self {
            pool: self.pool.clone(),
            id: self.id,
            data: self.data.clone(),
        }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        // Our Arc must be gone before the pool tries to unwrap its own.
        // A handle without payload was consumed by into_raw.
        if let Some(data) = self.data.take() {
            drop(data);
            if let Err(e) = self.pool.release(self.id) {
                warn!(error = %e, "release of FrameRef failed");
            }
        }
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("id", &self.id)
            .field("frame_index", &self.payload().frame_index)
            .field("timestamp", &self.payload().timestamp)
            .finish()
    }
}
