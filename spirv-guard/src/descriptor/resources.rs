//! Tracked views over the lifetime-tracked resource objects.
//!
//! The general object lifetime tracker lives outside this crate; the wrappers here decorate
//! its per-object state with a [`DescriptorId`] acquired at construction and released when
//! either the destruction hook or the invalidation-notification hook fires. The heap
//! back-reference is non-owning: the heap outlives every resource object.

use super::{DescriptorHeap, DescriptorId, ObjectKind, TrackedHandle};
use std::sync::Arc;

/// The hooks a lifetime-tracked base object exposes to this layer.
///
/// `notify_invalidate` fires when something the object depends on becomes invalid; the
/// implementation must propagate the invalidation without taking ownership of the listed
/// dependencies.
pub trait ResourceState {
    /// Raw handle value, used for diagnostic attribution.
    fn raw_handle(&self) -> u64;

    fn destroy(&mut self) {}

    fn notify_invalidate(&mut self, invalid: &[TrackedHandle], unlink: bool) {
        let _ = (invalid, unlink);
    }
}

macro_rules! tracked_resource {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name<S: ResourceState> {
            base: S,
            heap: Arc<DescriptorHeap>,
            id: DescriptorId,
        }

        impl<S: ResourceState> $name<S> {
            pub fn new(base: S, heap: Arc<DescriptorHeap>) -> Self {
                let id = heap.next_id(TrackedHandle {
                    kind: $kind,
                    raw: base.raw_handle(),
                });
                $name { base, heap, id }
            }

            #[inline]
            pub fn descriptor_id(&self) -> DescriptorId {
                self.id
            }

            #[inline]
            pub fn base(&self) -> &S {
                &self.base
            }

            /// Releases the descriptor id, then performs the base teardown.
            pub fn destroy(&mut self) {
                self.release_id();
                self.base.destroy();
            }

            /// Releases the descriptor id, then forwards the notification to the base hook.
            pub fn notify_invalidate(&mut self, invalid: &[TrackedHandle], unlink: bool) {
                self.release_id();
                self.base.notify_invalidate(invalid, unlink);
            }

            // Both hooks may fire for one object; the first release wins so a reissued id is
            // never pulled out from under its new holder.
            fn release_id(&mut self) {
                let id = std::mem::replace(&mut self.id, DescriptorId::UNKNOWN);
                self.heap.delete_id(id);
            }
        }
    };
}

tracked_resource! {
    /// A buffer with a validation-tracked identity.
    Buffer, ObjectKind::Buffer
}
tracked_resource! {
    /// A buffer view with a validation-tracked identity.
    BufferView, ObjectKind::BufferView
}
tracked_resource! {
    /// An image view with a validation-tracked identity.
    ImageView, ObjectKind::ImageView
}
tracked_resource! {
    /// A sampler with a validation-tracked identity.
    Sampler, ObjectKind::Sampler
}
tracked_resource! {
    /// A KHR acceleration structure with a validation-tracked identity.
    AccelerationStructureKhr, ObjectKind::AccelerationStructureKhr
}
tracked_resource! {
    /// An NV acceleration structure with a validation-tracked identity.
    AccelerationStructureNv, ObjectKind::AccelerationStructureNv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct StubState {
        raw: u64,
        destroyed: bool,
        invalidated: usize,
    }

    impl ResourceState for StubState {
        fn raw_handle(&self) -> u64 {
            self.raw
        }

        fn destroy(&mut self) {
            self.destroyed = true;
        }

        fn notify_invalidate(&mut self, _invalid: &[TrackedHandle], _unlink: bool) {
            self.invalidated += 1;
        }
    }

    #[test]
    fn construction_registers_and_destroy_releases() {
        let heap = Arc::new(DescriptorHeap::new());
        let mut buffer = Buffer::new(
            StubState {
                raw: 0xdead,
                ..Default::default()
            },
            heap.clone(),
        );

        let id = buffer.descriptor_id();
        assert_eq!(
            heap.handle_for(id),
            Some(TrackedHandle {
                kind: ObjectKind::Buffer,
                raw: 0xdead,
            })
        );

        buffer.destroy();
        assert!(buffer.base().destroyed);
        assert_eq!(heap.handle_for(id), None);
    }

    #[test]
    fn invalidation_releases_and_forwards() {
        let heap = Arc::new(DescriptorHeap::new());
        let mut view = ImageView::new(StubState::default(), heap.clone());
        let id = view.descriptor_id();

        view.notify_invalidate(&[], true);
        assert_eq!(view.base().invalidated, 1);
        assert_eq!(heap.handle_for(id), None);

        // Destruction after invalidation must not release someone else's reused id.
        let other = Sampler::new(StubState::default(), heap.clone());
        assert_eq!(other.descriptor_id(), id); // freed id is reusable
        view.destroy();
        assert!(heap.handle_for(id).is_some());
    }

    #[test]
    fn kinds_do_not_share_identity_semantics() {
        let heap = Arc::new(DescriptorHeap::new());
        let buffer = Buffer::new(StubState { raw: 1, ..Default::default() }, heap.clone());
        let sampler = Sampler::new(StubState { raw: 1, ..Default::default() }, heap.clone());
        assert_ne!(buffer.descriptor_id(), sampler.descriptor_id());
    }
}
