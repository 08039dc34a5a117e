//! GPU-assisted validation instrumentation for SPIR-V shader modules.
//!
//! Some classes of memory-safety violations inside shaders cannot be caught by host-side
//! inspection, because the offending index or address is only computed while the shader runs on
//! the device: out-of-bounds buffer and image accesses, invalid buffer-device-address
//! dereferences, bindless descriptors selected by a runtime index. This crate provides the
//! machinery a validation layer needs to catch them anyway:
//!
//! - The [`instrument`] module walks a shader [`Module`](spirv::Module) and, wherever a concrete
//!   [`InstrumentationPass`](instrument::InstrumentationPass) marks an instruction as risky,
//!   injects a call to a device-side check function. The risky instruction can be wrapped in a
//!   conditional guard so that an invalid write is skipped and an invalid read is replaced by
//!   zero through a phi merge.
//!
//! - The [`command_buffer`] module owns the per-command-buffer GPU channel the injected code
//!   writes into: a bounded error output buffer, a per-command error counter region, and a
//!   versioned snapshot of the live buffer-device-address ranges. After the device has finished
//!   executing, [`CommandBuffer::post_process`](command_buffer::CommandBuffer::post_process)
//!   walks the recorded entries and dispatches each one to the error logger that was registered
//!   for the command that produced it.
//!
//! - The [`descriptor`] module hands out small stable identifiers for the resource objects that
//!   instrumented shaders can reference through bindless indices, so a raw index read back from
//!   the GPU can be attributed to a host-side object.
//!
//! - [`Queue::pre_submit`](queue::Queue::pre_submit) is the single ordering point that brings
//!   every command buffer's channel buffers into their expected state before execution begins.
//!
//! Instrumentation happens once per shader module; the rewritten module is cached by content
//! digest and reused across recordings. Everything driver-specific (dispatch tables, the real
//! allocator, fence waits) stays outside this crate behind the [`memory::MemoryAllocator`] seam
//! and the caller's submission sequencing.

pub mod command_buffer;
pub mod descriptor;
pub mod instrument;
pub mod memory;
pub mod queue;
pub mod spirv;
pub mod validator;

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Error type returned when a GPU or host allocation fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl Display for OomError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "{}",
            match self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the device",
            }
        )
    }
}

/// Identifies the call site a diagnostic is attributed to.
///
/// The surrounding layer maps entry points to locations; this crate only threads the value
/// through to the messenger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location(pub &'static str);

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}
