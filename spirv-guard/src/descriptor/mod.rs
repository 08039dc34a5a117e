//! Stable identities for resources reachable through bindless descriptors.
//!
//! When instrumented code reports an invalid bindless access, all the GPU can hand back is a
//! small integer. The [`DescriptorHeap`] is the device-scoped registry that makes those
//! integers meaningful: every validation-tracked resource object acquires a [`DescriptorId`]
//! at construction and releases it on destruction, so a raw id read out of an error record
//! can be attributed to a live host-side object.

pub use self::resources::{
    AccelerationStructureKhr, AccelerationStructureNv, Buffer, BufferView, ImageView,
    ResourceState, Sampler,
};

mod resources;

use foldhash::HashMap;
use parking_lot::Mutex;

/// A small integer unique among currently-live tracked objects.
///
/// Released ids become eligible for reuse once the owning object's destruction notification
/// completes; `0` is reserved to mean "no id".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorId(u32);

impl DescriptorId {
    pub const UNKNOWN: DescriptorId = DescriptorId(0);

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// The kinds of resource objects the validation layer tracks by descriptor id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    BufferView,
    ImageView,
    Sampler,
    AccelerationStructureKhr,
    AccelerationStructureNv,
    // These two never receive descriptor ids; they appear in the object lists attached to
    // decoded error records.
    CommandBuffer,
    Queue,
}

/// Back-reference from a descriptor id to the host object it was issued for, used for
/// diagnostic attribution only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackedHandle {
    pub kind: ObjectKind,
    pub raw: u64,
}

#[derive(Debug, Default)]
struct HeapInner {
    next: u32,
    free: Vec<u32>,
    live: HashMap<u32, TrackedHandle>,
}

/// Device-scoped allocator/registry of [`DescriptorId`]s.
///
/// Shared by many resource objects and command buffers; every mutation and lookup goes
/// through one mutex. The heap must outlive every resource object holding one of its ids.
#[derive(Debug, Default)]
pub struct DescriptorHeap {
    inner: Mutex<HeapInner>,
}

impl DescriptorHeap {
    pub fn new() -> Self {
        DescriptorHeap {
            inner: Mutex::new(HeapInner {
                next: 1,
                free: Vec::new(),
                live: HashMap::default(),
            }),
        }
    }

    /// Issues the next id for `handle`.
    ///
    /// An id currently held by a live object is never handed out again; freed ids may be.
    pub fn next_id(&self, handle: TrackedHandle) -> DescriptorId {
        let mut inner = self.inner.lock();
        let raw = match inner.free.pop() {
            Some(raw) => raw,
            None => {
                let raw = inner.next;
                inner.next = raw
                    .checked_add(1)
                    .expect("descriptor heap id space exhausted");
                raw
            }
        };
        inner.live.insert(raw, handle);
        DescriptorId(raw)
    }

    /// Releases `id` back to the heap. Releasing an id twice (or [`DescriptorId::UNKNOWN`])
    /// is a no-op; both the destruction and the invalidation hook of a resource release its
    /// id, and either may fire first.
    pub fn delete_id(&self, id: DescriptorId) {
        if id == DescriptorId::UNKNOWN {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.live.remove(&id.0).is_some() {
            inner.free.push(id.0);
        }
    }

    /// The object `id` is currently issued for, if any.
    pub fn handle_for(&self, id: DescriptorId) -> Option<TrackedHandle> {
        self.inner.lock().live.get(&id.0).copied()
    }

    /// Number of currently-live ids.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}
