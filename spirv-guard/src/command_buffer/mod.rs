//! The per-command-buffer GPU runtime channel.
//!
//! Each tracked command buffer owns a small set of host-visible buffers the injected device
//! code communicates through: a bounded error output buffer, a per-command error counter
//! region, the bindless descriptor state and, when buffer-device-address validation is on, a
//! snapshot of the live address ranges. [`CommandBuffer::pre_process`] brings those buffers
//! into their expected state before a submit; [`CommandBuffer::post_process`] decodes what
//! the device wrote back once execution has finished.

pub mod layout;

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

use ash::vk::{self, Handle};

use crate::{
    descriptor::{ObjectKind, TrackedHandle},
    memory::{DeviceMemoryBlock, MemoryLocation},
    validator::{Message, MessageSeverity, Validator},
    Location, OomError,
};
use self::layout::{
    BindlessStateBuffer, DescriptorSetSlot, CMD_ERRORS_COUNT_WORDS, ERROR_BUFFER_WORDS,
    ERROR_RECORD_WORDS, MAX_BOUND_DESCRIPTOR_SETS, OUTPUT_DATA_OFFSET, OUTPUT_FLAGS_OFFSET,
    OUTPUT_FLAG_DESCRIPTOR_CHECKS, OUTPUT_SIZE_OFFSET, RECORD_COMMAND_INDEX_OFFSET,
    RECORD_SIZE_OFFSET,
};

/// Decodes the records a single command produced.
///
/// Receives the full record (header included) and the object list for attribution. Returns
/// `true` if the record was recognized and reported; unrecognized records fall back to a
/// generic diagnostic.
pub type ErrorLoggerFunc =
    Box<dyn FnMut(&Validator, &[u32], &[TrackedHandle]) -> bool + Send>;

/// Error raised while bringing a command buffer's channel into its pre-submit state.
#[derive(Debug)]
pub enum PreProcessError {
    OomError(OomError),
    /// More live buffer-device-address ranges than the snapshot can hold.
    BdaRangeCapacityExceeded { in_use: u32, max: u32 },
}

impl Error for PreProcessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PreProcessError::OomError(err) => Some(err),
            PreProcessError::BdaRangeCapacityExceeded { .. } => None,
        }
    }
}

impl Display for PreProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PreProcessError::OomError(_) => write!(f, "allocating the runtime channel failed"),
            PreProcessError::BdaRangeCapacityExceeded { in_use, max } => write!(
                f,
                "{} buffer device address ranges are in use but the snapshot holds at most {}",
                in_use, max,
            ),
        }
    }
}

impl From<OomError> for PreProcessError {
    fn from(err: OomError) -> Self {
        PreProcessError::OomError(err)
    }
}

/// Shadow state of one bound descriptor set, shared between the set object and every
/// command buffer it is bound in.
#[derive(Debug, Default)]
pub struct DescriptorSetShadow {
    pub layout_data: vk::DeviceAddress,
    pub in_data: vk::DeviceAddress,
    pub out_data: vk::DeviceAddress,
}

/// Indirect-command parameters captured at record time, needed to decode draw-indirect
/// error records.
#[derive(Copy, Clone, Debug)]
pub struct CmdIndirectState {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub draw_count: u32,
    pub stride: u32,
    pub count_buffer: Option<(vk::Buffer, vk::DeviceSize)>,
}

/// The channel state attached to one Vulkan command buffer.
///
/// Lifetime follows the command buffer it shadows: created with it, [`reset`] with it,
/// [`destroy`]ed with it. Not internally synchronized; the caller serializes access the
/// same way it must serialize the underlying command buffer.
///
/// [`reset`]: Self::reset
/// [`destroy`]: Self::destroy
pub struct CommandBuffer {
    validator: Arc<Validator>,
    handle: vk::CommandBuffer,

    error_output: DeviceMemoryBlock,
    cmd_errors_counts: DeviceMemoryBlock,
    bindless_state: DeviceMemoryBlock,
    bda_snapshot: DeviceMemoryBlock,
    // Registry version the snapshot was last built from; 0 = never built.
    bda_snapshot_version: u32,

    bound_descriptor_sets: Vec<Option<Arc<DescriptorSetShadow>>>,
    error_loggers: Vec<ErrorLoggerFunc>,
    indirect_states: Vec<CmdIndirectState>,

    draw_index: u32,
    dispatch_index: u32,
    trace_rays_index: u32,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("error_loggers", &self.error_loggers.len())
            .field("bda_snapshot_version", &self.bda_snapshot_version)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Allocates the channel buffers for a freshly created command buffer.
    pub fn new(
        validator: Arc<Validator>,
        handle: vk::CommandBuffer,
    ) -> Result<Self, OomError> {
        let mut this = CommandBuffer {
            validator,
            handle,
            error_output: DeviceMemoryBlock::NULL,
            cmd_errors_counts: DeviceMemoryBlock::NULL,
            bindless_state: DeviceMemoryBlock::NULL,
            bda_snapshot: DeviceMemoryBlock::NULL,
            bda_snapshot_version: 0,
            bound_descriptor_sets: vec![None; MAX_BOUND_DESCRIPTOR_SETS],
            error_loggers: Vec::new(),
            indirect_states: Vec::new(),
            draw_index: 0,
            dispatch_index: 0,
            trace_rays_index: 0,
        };
        this.allocate_resources()?;
        Ok(this)
    }

    fn allocate_resources(&mut self) -> Result<(), OomError> {
        let allocator = Arc::clone(self.validator.allocator());
        let settings = self.validator.settings().clone();

        self.error_output = allocator.create_buffer(
            (ERROR_BUFFER_WORDS * 4) as vk::DeviceSize,
            MemoryLocation::HostVisibleCoherent,
        )?;
        if settings.validate_descriptors {
            allocator.map(&self.error_output, &mut |words| {
                words[OUTPUT_FLAGS_OFFSET] = OUTPUT_FLAG_DESCRIPTOR_CHECKS;
            })?;
        }

        self.cmd_errors_counts = allocator.create_buffer(
            (CMD_ERRORS_COUNT_WORDS * 4) as vk::DeviceSize,
            MemoryLocation::HostVisibleCoherent,
        )?;

        if settings.validate_descriptors {
            self.bindless_state = allocator.create_buffer(
                std::mem::size_of::<BindlessStateBuffer>() as vk::DeviceSize,
                MemoryLocation::HostVisibleCoherent,
            )?;
        }

        if settings.validate_bda {
            // One leading count qword, then a begin/end qword pair per range.
            let qwords = 1 + 2 * settings.max_bda_ranges as vk::DeviceSize;
            self.bda_snapshot =
                allocator.create_buffer(qwords * 8, MemoryLocation::HostVisibleCached)?;
        }

        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    #[inline]
    pub fn error_output_buffer(&self) -> vk::Buffer {
        self.error_output.buffer()
    }

    /// Records a descriptor set binding. Later bindings to the same index replace earlier
    /// ones, as the pipeline would see them.
    pub fn bind_descriptor_set(&mut self, set_index: u32, shadow: Arc<DescriptorSetShadow>) {
        assert!(
            (set_index as usize) < MAX_BOUND_DESCRIPTOR_SETS,
            "descriptor set index {} out of range",
            set_index,
        );
        self.bound_descriptor_sets[set_index as usize] = Some(shadow);
    }

    /// Registers the decoder for the next command's error records and returns the command
    /// index the injected checks must stamp into them.
    pub fn register_error_logger(&mut self, logger: ErrorLoggerFunc) -> u32 {
        let index = self.error_loggers.len();
        assert!(
            index < CMD_ERRORS_COUNT_WORDS,
            "more commands than error counter slots"
        );
        self.error_loggers.push(logger);
        index as u32
    }

    pub fn register_indirect_state(&mut self, state: CmdIndirectState) {
        self.indirect_states.push(state);
    }

    #[inline]
    pub fn indirect_states(&self) -> &[CmdIndirectState] {
        &self.indirect_states
    }

    /// Per-action-command counters, used by check builders to label their records.
    pub fn next_draw_index(&mut self) -> u32 {
        let index = self.draw_index;
        self.draw_index += 1;
        index
    }

    pub fn next_dispatch_index(&mut self) -> u32 {
        let index = self.dispatch_index;
        self.dispatch_index += 1;
        index
    }

    pub fn next_trace_rays_index(&mut self) -> u32 {
        let index = self.trace_rays_index;
        self.trace_rays_index += 1;
        index
    }

    /// Brings every channel buffer into its pre-submit state.
    ///
    /// Returns `true` if the command buffer recorded any validated commands, so the caller
    /// knows whether a post-execution read-back is needed at all.
    pub fn pre_process(&mut self) -> Result<bool, PreProcessError> {
        if self.error_output.is_null() {
            // Destroyed (or allocation failed at creation); nothing to submit for.
            return Ok(false);
        }
        if self.validator.settings().validate_descriptors {
            self.update_bindless_state_buffer()?;
        }
        if self.validator.settings().validate_bda {
            self.update_bda_ranges_snapshot()?;
        }
        Ok(!self.error_loggers.is_empty())
    }

    fn update_bindless_state_buffer(&mut self) -> Result<(), PreProcessError> {
        let mut state = BindlessStateBuffer {
            global_state: 0,
            desc_sets: [DescriptorSetSlot::default(); MAX_BOUND_DESCRIPTOR_SETS],
        };
        for (slot, shadow) in state
            .desc_sets
            .iter_mut()
            .zip(&self.bound_descriptor_sets)
        {
            if let Some(shadow) = shadow {
                slot.layout_data = shadow.layout_data;
                slot.in_data = shadow.in_data;
                slot.out_data = shadow.out_data;
            }
        }
        let words = bytemuck::pod_collect_to_vec::<_, u32>(&[state]);
        self.validator
            .allocator()
            .map(&self.bindless_state, &mut |dst| {
                dst[..words.len()].copy_from_slice(&words);
            })?;
        Ok(())
    }

    /// Rewrites the address-range snapshot if the registry changed since it was last
    /// built. Returns whether a rebuild happened.
    pub fn update_bda_ranges_snapshot(&mut self) -> Result<bool, PreProcessError> {
        let version = self.validator.bda_ranges_version();
        if version == self.bda_snapshot_version {
            return Ok(false);
        }

        let ranges = self.validator.buffer_address_ranges();
        let max = self.validator.settings().max_bda_ranges;
        if ranges.len() as u64 > max as u64 {
            return Err(PreProcessError::BdaRangeCapacityExceeded {
                in_use: ranges.len() as u32,
                max,
            });
        }

        let allocator = Arc::clone(self.validator.allocator());
        allocator.map(&self.bda_snapshot, &mut |words| {
            write_qword(words, 0, ranges.len() as u64);
            for (i, &(begin, end)) in ranges.iter().enumerate() {
                write_qword(words, 1 + 2 * i, begin);
                write_qword(words, 2 + 2 * i, end);
            }
        })?;
        allocator.flush(&self.bda_snapshot);

        self.bda_snapshot_version = version;
        Ok(true)
    }

    /// Decodes the error records the device wrote during execution and rearms the channel.
    ///
    /// Must only be called once the device has finished executing this command buffer on
    /// `queue`; the caller owns that wait.
    pub fn post_process(&mut self, queue: vk::Queue, location: Location) -> Result<(), OomError> {
        if self.error_output.is_null() {
            return Ok(());
        }
        let allocator = Arc::clone(self.validator.allocator());
        let validator = Arc::clone(&self.validator);
        let objects = [
            TrackedHandle {
                kind: ObjectKind::Queue,
                raw: queue.as_raw(),
            },
            TrackedHandle {
                kind: ObjectKind::CommandBuffer,
                raw: self.handle.as_raw(),
            },
        ];

        let loggers = &mut self.error_loggers;
        allocator.map(&self.error_output, &mut |words| {
            let capacity = ERROR_BUFFER_WORDS - OUTPUT_DATA_OFFSET;
            let written = words[OUTPUT_SIZE_OFFSET] as usize;
            if written > capacity {
                validator.report(&Message {
                    severity: MessageSeverity::Warning,
                    description: &format!(
                        "error output buffer overflowed; {} words of records were lost",
                        written - capacity,
                    ),
                    objects: &objects,
                    location: Some(location),
                });
            }

            let data = &words[OUTPUT_DATA_OFFSET..ERROR_BUFFER_WORDS];
            let mut cursor = 0;
            while cursor + ERROR_RECORD_WORDS <= written.min(capacity) {
                let record = &data[cursor..cursor + ERROR_RECORD_WORDS];
                if record[RECORD_SIZE_OFFSET] == 0 {
                    break;
                }
                cursor += record[RECORD_SIZE_OFFSET] as usize;

                let command_index = record[RECORD_COMMAND_INDEX_OFFSET] as usize;
                let decoded = match loggers.get_mut(command_index) {
                    Some(logger) => logger(&validator, record, &objects),
                    None => false,
                };
                if !decoded {
                    validator.report(&Message {
                        severity: MessageSeverity::Error,
                        description: &format!(
                            "unhandled error record for command {} (group {})",
                            command_index,
                            record[layout::RECORD_GROUP_OFFSET],
                        ),
                        objects: &objects,
                        location: Some(location),
                    });
                }
            }

            // Rearm for the next submit of this recording.
            words[OUTPUT_SIZE_OFFSET] = 0;
            words[OUTPUT_DATA_OFFSET..].fill(0);
        })?;

        allocator.map(&self.cmd_errors_counts, &mut |words| words.fill(0))?;

        Ok(())
    }

    /// Counterpart of `vkResetCommandBuffer`: drops all recorded state and rearms the
    /// channel buffers for a new recording.
    pub fn reset(&mut self) -> Result<(), OomError> {
        self.free_resources();
        self.bound_descriptor_sets = vec![None; MAX_BOUND_DESCRIPTOR_SETS];
        self.error_loggers.clear();
        self.indirect_states.clear();
        self.draw_index = 0;
        self.dispatch_index = 0;
        self.trace_rays_index = 0;
        self.allocate_resources()
    }

    /// Counterpart of command buffer destruction. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.free_resources();
        self.bound_descriptor_sets.clear();
        self.error_loggers.clear();
        self.indirect_states.clear();
    }

    fn free_resources(&mut self) {
        let allocator = Arc::clone(self.validator.allocator());
        allocator.destroy_buffer(&mut self.error_output);
        allocator.destroy_buffer(&mut self.cmd_errors_counts);
        allocator.destroy_buffer(&mut self.bindless_state);
        allocator.destroy_buffer(&mut self.bda_snapshot);
        self.bda_snapshot_version = 0;
    }
}

#[inline]
fn write_qword(words: &mut [u32], qword_index: usize, value: u64) {
    words[2 * qword_index] = value as u32;
    words[2 * qword_index + 1] = (value >> 32) as u32;
}
