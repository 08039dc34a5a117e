//! Word-level layouts shared between the injected device code and the host decoder.
//!
//! Everything in this module is part of the host/device ABI: the injected check functions
//! write these offsets, [`CommandBuffer::post_process`](super::CommandBuffer::post_process)
//! reads them back. [`record_error`] is the host-side statement of the device write
//! protocol and is what the channel tests drive.

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// Total size of the error output buffer, in `u32` words, header included.
pub const ERROR_BUFFER_WORDS: usize = 8192;

/// Bit set in the flags word while descriptor checks are enabled for the recording.
pub const OUTPUT_FLAG_DESCRIPTOR_CHECKS: u32 = 1;

/// Offset of the flags word in the error output buffer.
pub const OUTPUT_FLAGS_OFFSET: usize = 0;
/// Offset of the written-words counter. Counts words *attempted*, so a value larger than
/// the data region's capacity means records were dropped on the device.
pub const OUTPUT_SIZE_OFFSET: usize = 1;
/// First word of the record data region.
pub const OUTPUT_DATA_OFFSET: usize = 2;

/// Every record occupies exactly this many words.
pub const ERROR_RECORD_WORDS: usize = 8;

/// Record word 0: the record's size in words. A zero size word terminates the walk.
pub const RECORD_SIZE_OFFSET: usize = 0;
/// Record word 1: the error group the producing check belongs to.
pub const RECORD_GROUP_OFFSET: usize = 1;
/// Record word 2: shader stage identifier of the producing invocation.
pub const RECORD_STAGE_ID_OFFSET: usize = 2;
/// Record word 3: pre-instrumentation position of the faulting instruction.
pub const RECORD_POSITION_OFFSET: usize = 3;
/// Record word 4: index of the command (draw/dispatch/trace) within the recording; selects
/// the error logger and the per-command error count slot.
pub const RECORD_COMMAND_INDEX_OFFSET: usize = 4;
/// Record words 5..8: error-group-specific payload.
pub const RECORD_PAYLOAD_OFFSET: usize = 5;

/// Size of the per-command error counter buffer, in words. One saturating counter per
/// command index.
pub const CMD_ERRORS_COUNT_WORDS: usize = 8192;

/// Upper bound on simultaneously bound descriptor sets the bindless state buffer can
/// describe.
pub const MAX_BOUND_DESCRIPTOR_SETS: usize = 32;

/// Device addresses of one bound descriptor set's shadow buffers, as the injected code
/// dereferences them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct DescriptorSetSlot {
    /// Layout description: binding count and per-binding descriptor counts/types.
    pub layout_data: vk::DeviceAddress,
    /// Written by the host before submit: which descriptor ids are currently written.
    pub in_data: vk::DeviceAddress,
    /// Written by the device: which descriptors the shader actually accessed.
    pub out_data: vk::DeviceAddress,
}

/// Contents of the bindless state buffer rebuilt by
/// [`CommandBuffer::pre_process`](super::CommandBuffer::pre_process). A slot whose
/// addresses are zero means no set is bound at that index.
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct BindlessStateBuffer {
    pub global_state: vk::DeviceAddress,
    pub desc_sets: [DescriptorSetSlot; MAX_BOUND_DESCRIPTOR_SETS],
}

/// Appends one error record to the output buffer, mirroring the write protocol of the
/// injected device code.
///
/// The counter slot for `command_index` is bumped first; once it reaches
/// `max_errors_per_command` further records from that command are dropped without touching
/// the output buffer. The size word is advanced even when the data region is full, so the
/// host can tell how many words were lost. Returns `true` if the record was stored.
pub fn record_error(
    output: &mut [u32],
    cmd_errors_counts: &mut [u32],
    command_index: u32,
    max_errors_per_command: u32,
    record: &[u32; ERROR_RECORD_WORDS],
) -> bool {
    assert_eq!(record[RECORD_SIZE_OFFSET] as usize, ERROR_RECORD_WORDS);
    assert_eq!(record[RECORD_COMMAND_INDEX_OFFSET], command_index);

    let count = &mut cmd_errors_counts[command_index as usize];
    if *count >= max_errors_per_command {
        return false;
    }
    *count += 1;

    let write_offset = output[OUTPUT_SIZE_OFFSET] as usize;
    output[OUTPUT_SIZE_OFFSET] = (write_offset + ERROR_RECORD_WORDS) as u32;

    let start = OUTPUT_DATA_OFFSET + write_offset;
    let Some(slot) = output.get_mut(start..start + ERROR_RECORD_WORDS) else {
        return false;
    };
    slot.copy_from_slice(record);

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command_index: u32, payload: u32) -> [u32; ERROR_RECORD_WORDS] {
        let mut r = [0u32; ERROR_RECORD_WORDS];
        r[RECORD_SIZE_OFFSET] = ERROR_RECORD_WORDS as u32;
        r[RECORD_GROUP_OFFSET] = 1;
        r[RECORD_COMMAND_INDEX_OFFSET] = command_index;
        r[RECORD_PAYLOAD_OFFSET] = payload;
        r
    }

    #[test]
    fn per_command_cap_saturates_per_command() {
        let mut output = vec![0u32; ERROR_BUFFER_WORDS];
        let mut counts = vec![0u32; CMD_ERRORS_COUNT_WORDS];

        for i in 0..10 {
            record_error(&mut output, &mut counts, 0, 4, &record(0, i));
        }
        record_error(&mut output, &mut counts, 1, 4, &record(1, 99));

        // Four stored for command 0, one for command 1.
        assert_eq!(
            output[OUTPUT_SIZE_OFFSET] as usize,
            5 * ERROR_RECORD_WORDS
        );
        assert_eq!(counts[0], 4);
        assert_eq!(counts[1], 1);
        let payload_of = |n: usize| {
            output[OUTPUT_DATA_OFFSET + n * ERROR_RECORD_WORDS + RECORD_PAYLOAD_OFFSET]
        };
        assert_eq!((payload_of(0), payload_of(3)), (0, 3));
        assert_eq!(payload_of(4), 99);
    }

    #[test]
    fn full_output_still_counts_attempted_words() {
        let mut output = vec![0u32; OUTPUT_DATA_OFFSET + ERROR_RECORD_WORDS];
        let mut counts = vec![0u32; 4];

        assert!(record_error(&mut output, &mut counts, 0, 8, &record(0, 7)));
        assert!(!record_error(&mut output, &mut counts, 0, 8, &record(0, 8)));

        assert_eq!(output[OUTPUT_SIZE_OFFSET] as usize, 2 * ERROR_RECORD_WORDS);
        assert_eq!(output[OUTPUT_DATA_OFFSET + RECORD_PAYLOAD_OFFSET], 7);
    }
}
