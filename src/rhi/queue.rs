//! Command Queue
//!
//! Single-queue, in-order submission. Each `execute_command_lists` call
//! retires the lists in submission order, signals the queue's timeline fence
//! and returns the [`SyncPoint`] identifying that submission.
//!
//! The software backend interprets the handful of commands whose results are
//! CPU-observable (storage copies, UAV clears, acceleration-structure
//! postbuild info); everything else is retired as-is.

use parking_lot::Mutex;

use super::commands::{Command, CommandContext};
use super::device::GraphicsDevice;
use super::fence::{Fence, SyncPoint};
use super::resources::{AnyResource, Ref};
use super::types::align_up;

/// Ratio applied by the software backend when reporting compacted
/// acceleration-structure sizes.
const COMPACTED_SIZE_NUMERATOR: u64 = 7;
const COMPACTED_SIZE_DENOMINATOR: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

/// A command queue with a monotonic timeline fence.
pub struct CommandQueue {
    kind: QueueKind,
    fence: Ref<Fence>,
    /// Command count of every submitted list, in submission order.
    submissions: Mutex<Vec<usize>>,
}

impl CommandQueue {
    #[must_use]
    pub fn new(kind: QueueKind, name: &str) -> Self {
        Self {
            kind,
            fence: Ref::new(Fence::new(name)),
            submissions: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[must_use]
    pub fn fence(&self) -> &Ref<Fence> {
        &self.fence
    }

    /// Number of command lists submitted so far.
    #[must_use]
    pub fn submitted_list_count(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Submits command lists in order and signals the timeline.
    ///
    /// Ordering guarantee: commands observe submission order within this
    /// queue. Recording may have happened on worker threads; submission is
    /// the serialization point.
    pub fn execute_command_lists(
        &self,
        device: &GraphicsDevice,
        contexts: Vec<CommandContext<'_>>,
    ) -> SyncPoint {
        let mut scratch_allocators = Vec::with_capacity(contexts.len());
        for context in contexts {
            let (commands, scratch) = context.take_parts();
            Self::retire_commands(&commands);
            self.submissions.lock().push(commands.len());
            device.recycle_command_storage(commands, &self.fence);
            scratch_allocators.push(scratch);
        }

        let value = self.fence.signal_next();
        let sync_point = SyncPoint::new(self.fence.clone(), value);

        for mut scratch in scratch_allocators {
            scratch.free(device, &sync_point);
        }
        sync_point
    }

    /// Blocks until all submitted work has completed.
    pub fn wait_idle(&self) {
        self.fence.cpu_wait(self.fence.last_signaled());
    }

    /// Applies the CPU-observable effects of a retired command list.
    fn retire_commands(commands: &[Command]) {
        for command in commands {
            match command {
                Command::ClearUavU32 { resource, value } => {
                    if let AnyResource::Buffer(buffer) = resource {
                        if buffer.has_storage() {
                            let fill: Vec<u8> = value
                                .to_le_bytes()
                                .iter()
                                .copied()
                                .cycle()
                                .take(buffer.size() as usize)
                                .collect();
                            buffer.write_storage(0, &fill);
                        }
                    }
                }
                Command::CopyBuffer {
                    src,
                    dst,
                    size,
                    src_offset,
                    dst_offset,
                } => {
                    src.copy_storage_to(dst, *size, *src_offset, *dst_offset);
                }
                Command::CopyResource { src, dst } => {
                    if let (AnyResource::Buffer(src), AnyResource::Buffer(dst)) = (src, dst) {
                        src.copy_storage_to(dst, src.size().min(dst.size()), 0, 0);
                    }
                }
                Command::EmitCompactedSizes { dest, sources } => {
                    for (index, source) in sources.iter().enumerate() {
                        let compacted = align_up(
                            source.size() * COMPACTED_SIZE_NUMERATOR / COMPACTED_SIZE_DENOMINATOR,
                            256,
                        );
                        dest.write_storage(index as u64 * 8, &compacted.to_le_bytes());
                    }
                }
                _ => {}
            }
        }
    }
}
