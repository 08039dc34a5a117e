//! Submission interception.
//!
//! `vkQueueSubmit` is the single point where every command buffer of a batch is guaranteed
//! to be in its final recorded state, so it is where the channel buffers are brought up to
//! date. The caller intercepts the submit, runs [`Queue::pre_submit`] over the batch, and
//! after the device has finished (a fence or queue wait it owns) retires it with
//! [`Queue::retire_submission`].

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::{
    command_buffer::{CommandBuffer, PreProcessError},
    validator::Validator,
    Location,
};

/// One batch of a queue submission, in submission order.
#[derive(Default)]
pub struct QueueSubmission {
    pub command_buffers: Vec<Arc<Mutex<CommandBuffer>>>,
}

/// Outcome of [`Queue::pre_submit`].
#[derive(Debug)]
pub enum PreSubmitResult {
    /// At least one command buffer carries validated commands; the caller must retire the
    /// submission after completion.
    Instrumented,
    /// Nothing in the batch was instrumented; no read-back is needed.
    Uninstrumented,
    /// A channel could not be brought into its pre-submit state. The caller decides
    /// whether to fail the submit or let it through unvalidated.
    Failed(PreProcessError),
}

/// The validation layer's view of one Vulkan queue.
#[derive(Debug)]
pub struct Queue {
    validator: Arc<Validator>,
    handle: vk::Queue,
    family_index: u32,
}

impl Queue {
    pub fn new(validator: Arc<Validator>, handle: vk::Queue, family_index: u32) -> Self {
        Queue {
            validator,
            handle,
            family_index,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    #[inline]
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    #[inline]
    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Prepares every command buffer of the batches for execution.
    ///
    /// Stops at the first failure; command buffers already processed stay valid, the
    /// submission as a whole is reported as failed.
    pub fn pre_submit(&self, submissions: &[QueueSubmission]) -> PreSubmitResult {
        let mut any_instrumented = false;
        for submission in submissions {
            for command_buffer in &submission.command_buffers {
                match command_buffer.lock().pre_process() {
                    Ok(instrumented) => any_instrumented |= instrumented,
                    Err(err) => return PreSubmitResult::Failed(err),
                }
            }
        }
        if any_instrumented {
            PreSubmitResult::Instrumented
        } else {
            PreSubmitResult::Uninstrumented
        }
    }

    /// Decodes the device's findings for a completed submission.
    ///
    /// The caller must have waited for the submission to finish executing on this queue.
    pub fn retire_submission(&self, submission: &QueueSubmission, location: Location) {
        for command_buffer in &submission.command_buffers {
            if let Err(err) = command_buffer.lock().post_process(self.handle, location) {
                self.validator.report_error(
                    &format!("reading back the error output failed: {}", err),
                    &[],
                    Some(location),
                );
            }
        }
    }
}
