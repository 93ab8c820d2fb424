// Staging memory allocator
//
// Pixel uploads go through transient host-visible buffers: the caller
// gets a span, writes into it from the CPU, and references it from
// copy commands recorded in the same frame. Spans stay live until the
// frame fence proves the GPU is done reading them, at which point
// every span in every buffer is released at once. That whole-buffer
// release is what makes the trailing-free-space scan below correct:
// free space in a buffer is always one contiguous tail.

use ash::vk;

use crate::device::Device;
use crate::Result;

use std::sync::Arc;

pub(crate) const MIN_STAGE_SIZE: vk::DeviceSize = 1024 * 1024; // 1MB
pub(crate) const MAX_STAGE_SIZE: vk::DeviceSize = 64 * MIN_STAGE_SIZE; // 64MB

/// One live sub-range of a staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StageAlloc {
    sa_start: vk::DeviceSize,
    sa_size: vk::DeviceSize,
}

/// One host-visible buffer/memory pair
///
/// Allocations are appended in increasing offset order and cleared
/// together. Buffers are never shrunk or destroyed before teardown.
struct StageBuffer {
    sb_buffer: vk::Buffer,
    sb_memory: vk::DeviceMemory,
    sb_capacity: vk::DeviceSize,
    sb_allocs: Vec<StageAlloc>,
}

impl StageBuffer {
    fn end_offset(&self) -> vk::DeviceSize {
        match self.sb_allocs.last() {
            Some(last) => last.sa_start + last.sa_size,
            None => 0,
        }
    }

    fn trailing_free(&self) -> vk::DeviceSize {
        self.sb_capacity.saturating_sub(self.end_offset())
    }

    #[cfg(test)]
    fn with_capacity(capacity: vk::DeviceSize) -> Self {
        Self {
            sb_buffer: vk::Buffer::null(),
            sb_memory: vk::DeviceMemory::null(),
            sb_capacity: capacity,
            sb_allocs: Vec::new(),
        }
    }
}

/// A byte range handed out by `StagePool::acquire`
///
/// This is a view into one of the pool's buffers, not an owned
/// resource. It is valid for host writes and GPU copy references until
/// the next `release_all`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageSpan {
    pub ss_buffer: vk::Buffer,
    pub ss_memory: vk::DeviceMemory,
    pub ss_offset: vk::DeviceSize,
    pub ss_size: vk::DeviceSize,
}

/// The pool of staging buffers, plus the command buffer transfer
/// commands referencing them are recorded into.
pub(crate) struct StagePool {
    sp_dev: Arc<Device>,
    /// most recently created buffer first
    sp_buffers: Vec<StageBuffer>,
    sp_cbuf: vk::CommandBuffer,
    sp_recording: bool,
}

impl StagePool {
    pub fn new(dev: Arc<Device>, cbuf: vk::CommandBuffer) -> Self {
        Self {
            sp_dev: dev,
            sp_buffers: Vec::new(),
            sp_cbuf: cbuf,
            sp_recording: false,
        }
    }

    /// Get the staging command buffer, opening it for recording if it
    /// is not already open.
    pub fn record(&mut self) -> vk::CommandBuffer {
        if !self.sp_recording {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            unsafe {
                self.sp_dev
                    .dev
                    .begin_command_buffer(self.sp_cbuf, &begin_info)
                    .expect("Could not begin staging command buffer");
            }
            self.sp_recording = true;
        }

        self.sp_cbuf
    }

    /// Close the staging command buffer if it was opened this frame,
    /// returning it for submission.
    pub fn finish_recording(&mut self) -> Option<vk::CommandBuffer> {
        if !self.sp_recording {
            return None;
        }

        unsafe {
            self.sp_dev
                .dev
                .end_command_buffer(self.sp_cbuf)
                .expect("Could not end staging command buffer");
        }
        self.sp_recording = false;
        Some(self.sp_cbuf)
    }

    /// Size for the next staging buffer given the request and the
    /// capacity of the most recently created buffer.
    ///
    /// Speculative doubling is capped at MAX_STAGE_SIZE, but a single
    /// request larger than the cap gets a right-sized buffer instead
    /// of a truncated one, so a returned span always fits its buffer.
    fn next_buffer_size(
        request: vk::DeviceSize,
        newest: Option<vk::DeviceSize>,
    ) -> vk::DeviceSize {
        let mut bsize = (request * 2).max(MIN_STAGE_SIZE);
        if let Some(prev) = newest {
            bsize = bsize.max(prev * 2);
        }

        if bsize > MAX_STAGE_SIZE {
            log::info!("staging buffers have reached their max size");
            bsize = MAX_STAGE_SIZE.max(request);
        }

        bsize
    }

    /// Claim `size` bytes of trailing free space from the first buffer
    /// that has room. The scan order is most-recent-first.
    fn claim_from(buffers: &mut [StageBuffer], size: vk::DeviceSize) -> Option<StageSpan> {
        for buf in buffers.iter_mut() {
            if buf.trailing_free() < size {
                continue;
            }

            let start = buf.end_offset();
            buf.sb_allocs.push(StageAlloc {
                sa_start: start,
                sa_size: size,
            });
            return Some(StageSpan {
                ss_buffer: buf.sb_buffer,
                ss_memory: buf.sb_memory,
                ss_offset: start,
                ss_size: size,
            });
        }

        None
    }

    /// Hand out a span with room for `size` bytes.
    ///
    /// The caller may write the span host-side and reference it from
    /// copy commands within the current frame.
    pub fn acquire(&mut self, size: vk::DeviceSize) -> Result<StageSpan> {
        if let Some(span) = Self::claim_from(self.sp_buffers.as_mut_slice(), size) {
            return Ok(span);
        }

        // no free buffer, create one
        let bsize = Self::next_buffer_size(size, self.sp_buffers.first().map(|b| b.sb_capacity));
        let (buffer, memory) = self.sp_dev.create_buffer_with_size(
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            bsize,
        )?;
        log::debug!("Created new staging buffer of size {}", bsize);

        self.sp_buffers.insert(
            0,
            StageBuffer {
                sb_buffer: buffer,
                sb_memory: memory,
                sb_capacity: bsize,
                sb_allocs: vec![StageAlloc {
                    sa_start: 0,
                    sa_size: size,
                }],
            },
        );

        Ok(StageSpan {
            ss_buffer: buffer,
            ss_memory: memory,
            ss_offset: 0,
            ss_size: size,
        })
    }

    /// Write `data` into a span previously returned by `acquire`.
    pub fn upload(&self, span: &StageSpan, data: &[u8]) {
        debug_assert!(data.len() as vk::DeviceSize <= span.ss_size);
        self.sp_dev.update_memory(span.ss_memory, span.ss_offset, data);
    }

    /// Release every allocation in every buffer.
    ///
    /// Only call this once the frame fence has been observed signaled;
    /// earlier, GPU reads of the spans may still be in flight.
    pub fn release_all(&mut self) {
        for buf in self.sp_buffers.iter_mut() {
            buf.sb_allocs.clear();
        }
    }
}

impl Drop for StagePool {
    fn drop(&mut self) {
        for buf in self.sp_buffers.iter() {
            if !buf.sb_allocs.is_empty() {
                log::error!(
                    "staging buffer dropped with {} allocations left",
                    buf.sb_allocs.len()
                );
            }

            unsafe {
                self.sp_dev.dev.destroy_buffer(buf.sb_buffer, None);
                self.sp_dev.dev.free_memory(buf.sb_memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_are_appended_without_overlap() {
        let mut bufs = vec![StageBuffer::with_capacity(MIN_STAGE_SIZE)];

        let a = StagePool::claim_from(&mut bufs, 10).unwrap();
        let b = StagePool::claim_from(&mut bufs, 20).unwrap();

        assert_eq!(a.ss_offset, 0);
        assert_eq!(b.ss_offset, 10);
        assert!(a.ss_offset + a.ss_size <= b.ss_offset);
        assert!(b.ss_offset + b.ss_size <= MIN_STAGE_SIZE);
    }

    #[test]
    fn released_buffers_are_reused_from_zero() {
        let mut bufs = vec![StageBuffer::with_capacity(MIN_STAGE_SIZE)];

        let first = StagePool::claim_from(&mut bufs, 100).unwrap();
        assert_eq!(first.ss_offset, 0);

        for buf in bufs.iter_mut() {
            buf.sb_allocs.clear();
        }

        let again = StagePool::claim_from(&mut bufs, 100).unwrap();
        assert_eq!(again.ss_offset, 0);
    }

    #[test]
    fn scan_prefers_most_recent_buffer() {
        // index 0 is the most recently created buffer
        let mut bufs = vec![
            StageBuffer::with_capacity(4096),
            StageBuffer::with_capacity(4096),
        ];
        bufs[1].sb_allocs.push(StageAlloc {
            sa_start: 0,
            sa_size: 64,
        });

        let span = StagePool::claim_from(&mut bufs, 128).unwrap();
        assert_eq!(span.ss_offset, 0);
        assert_eq!(bufs[0].sb_allocs.len(), 1);
        assert_eq!(bufs[1].sb_allocs.len(), 1);
    }

    #[test]
    fn full_buffers_are_skipped() {
        let mut bufs = vec![StageBuffer::with_capacity(256)];
        StagePool::claim_from(&mut bufs, 200).unwrap();

        // 56 bytes of tail left, a 100 byte request must go elsewhere
        assert!(StagePool::claim_from(&mut bufs, 100).is_none());
        let small = StagePool::claim_from(&mut bufs, 56).unwrap();
        assert_eq!(small.ss_offset, 200);
    }

    #[test]
    fn buffer_sizing_policy() {
        // small requests are clamped up to the minimum
        assert_eq!(StagePool::next_buffer_size(16, None), MIN_STAGE_SIZE);

        // growth doubles the most recent buffer
        assert_eq!(
            StagePool::next_buffer_size(16, Some(MIN_STAGE_SIZE)),
            2 * MIN_STAGE_SIZE
        );

        // speculative growth is capped
        assert_eq!(
            StagePool::next_buffer_size(16, Some(MAX_STAGE_SIZE)),
            MAX_STAGE_SIZE
        );

        // a request above the cap still gets a buffer it fits in
        let huge = MAX_STAGE_SIZE + 4096;
        assert_eq!(StagePool::next_buffer_size(huge, Some(MAX_STAGE_SIZE)), huge);
    }
}
