//! Device-scoped state shared by every command buffer and queue of the validation layer.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use ash::vk;
use parking_lot::Mutex;

use crate::{
    descriptor::{DescriptorHeap, TrackedHandle},
    instrument::InstrumentationCache,
    memory::MemoryAllocator,
    Location,
};

/// Tuning knobs for the validation layer, fixed at device creation.
#[derive(Clone, Debug)]
pub struct ValidatorSettings {
    /// Wrap risky instructions in a conditional guard instead of only reporting. When
    /// disabled, injected checks still record errors but the faulting instruction executes
    /// unchanged.
    pub conditional_guards: bool,
    /// Enable descriptor indexing checks and the bindless state channel.
    pub validate_descriptors: bool,
    /// Enable buffer-device-address checks and the range snapshot channel.
    pub validate_bda: bool,
    /// Capacity of the per-command-buffer address-range snapshot.
    pub max_bda_ranges: u32,
    /// Per-command saturation threshold for error records.
    pub max_errors_per_command: u32,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        ValidatorSettings {
            conditional_guards: true,
            validate_descriptors: true,
            validate_bda: true,
            max_bda_ranges: 10_000,
            max_errors_per_command: 32,
        }
    }
}

/// Severity of a [`Message`] handed to the messenger callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageSeverity {
    Verbose,
    Information,
    Warning,
    Error,
}

/// A diagnostic produced by the layer, either decoded from a device error record or raised
/// by the layer itself.
#[derive(Debug)]
pub struct Message<'a> {
    pub severity: MessageSeverity,
    pub description: &'a str,
    /// Objects the diagnostic is attributed to, innermost first.
    pub objects: &'a [TrackedHandle],
    pub location: Option<Location>,
}

pub type MessengerCallback = Arc<dyn Fn(&Message<'_>) + Send + Sync>;

/// The device-scoped core of the validation layer.
///
/// Owns the descriptor identity heap, the instrumentation cache, the registry of live
/// buffer-device-address ranges, and the messenger diagnostics flow through. Command
/// buffers and queues hold it through an `Arc`.
pub struct Validator {
    settings: ValidatorSettings,
    allocator: Arc<dyn MemoryAllocator>,
    descriptor_heap: Arc<DescriptorHeap>,
    instrumentation_cache: InstrumentationCache,
    bda_ranges: Mutex<Vec<(vk::DeviceAddress, vk::DeviceAddress)>>,
    // Bumped on every registry mutation; snapshots compare against it to skip rebuilds.
    bda_ranges_version: AtomicU32,
    messenger: Option<MessengerCallback>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("settings", &self.settings)
            .field("descriptor_heap", &self.descriptor_heap)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(
        settings: ValidatorSettings,
        allocator: Arc<dyn MemoryAllocator>,
        messenger: Option<MessengerCallback>,
    ) -> Arc<Self> {
        Arc::new(Validator {
            settings,
            allocator,
            descriptor_heap: Arc::new(DescriptorHeap::new()),
            instrumentation_cache: InstrumentationCache::new(),
            bda_ranges: Mutex::new(Vec::new()),
            // Snapshots start at 0 meaning "never built"; the registry starts ahead of
            // them so the first pre-process always builds.
            bda_ranges_version: AtomicU32::new(1),
            messenger,
        })
    }

    #[inline]
    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    #[inline]
    pub fn descriptor_heap(&self) -> &Arc<DescriptorHeap> {
        &self.descriptor_heap
    }

    #[inline]
    pub fn instrumentation_cache(&self) -> &InstrumentationCache {
        &self.instrumentation_cache
    }

    /// Registers the address range of a newly created buffer-device-address buffer.
    pub fn insert_buffer_address_range(&self, begin: vk::DeviceAddress, end: vk::DeviceAddress) {
        assert!(begin < end, "empty or inverted address range");
        let mut ranges = self.bda_ranges.lock();
        ranges.push((begin, end));
        ranges.sort_unstable();
        self.bda_ranges_version.fetch_add(1, Ordering::Release);
    }

    /// Unregisters a range when its buffer is destroyed. Unknown ranges are ignored.
    pub fn remove_buffer_address_range(&self, begin: vk::DeviceAddress, end: vk::DeviceAddress) {
        let mut ranges = self.bda_ranges.lock();
        if let Some(index) = ranges.iter().position(|&r| r == (begin, end)) {
            ranges.remove(index);
            self.bda_ranges_version.fetch_add(1, Ordering::Release);
        }
    }

    /// The live ranges, sorted by begin address.
    pub fn buffer_address_ranges(&self) -> Vec<(vk::DeviceAddress, vk::DeviceAddress)> {
        self.bda_ranges.lock().clone()
    }

    #[inline]
    pub fn bda_ranges_version(&self) -> u32 {
        self.bda_ranges_version.load(Ordering::Acquire)
    }

    /// Forwards a diagnostic to the messenger, if one is installed.
    pub fn report(&self, message: &Message<'_>) {
        if let Some(messenger) = &self.messenger {
            messenger(message);
        }
    }

    pub fn report_error(
        &self,
        description: &str,
        objects: &[TrackedHandle],
        location: Option<Location>,
    ) {
        self.report(&Message {
            severity: MessageSeverity::Error,
            description,
            objects,
            location,
        });
    }
}
