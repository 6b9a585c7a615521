use quill_valloc::VirtualBlockError;
use thiserror::Error;

use crate::device::DescriptorHeapKind;

/// Failure reported by a [`crate::device::Device`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown {kind} id {id}")]
    UnknownObject { kind: &'static str, id: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of device memory ({requested} bytes requested)")]
    OutOfDeviceMemory { requested: u64 },
    #[error("command allocator {0} reset while its command lists are still executing")]
    AllocatorInFlight(u32),
    #[error("command list {0} is closed")]
    CommandListClosed(u32),
    #[error("command list {0} is still recording")]
    CommandListOpen(u32),
    #[error("timed out after {timeout_ms} ms waiting for fence {fence} to reach {value}")]
    FenceTimeout {
        fence: u32,
        value: u64,
        timeout_ms: u64,
    },
    #[error("swapchain unavailable: {0}")]
    SwapchainUnavailable(String),
    #[error("operation not supported by this device: {0}")]
    Unsupported(&'static str),
    /// A native API call returned a failing `HRESULT`.
    #[error("{call} failed with HRESULT {hresult:#010x}")]
    Native { call: &'static str, hresult: u32 },
}

/// Every block was tried `attempts` times and none could hold the request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out of memory: {requested} bytes (alignment {alignment}) after {attempts} attempts")]
pub struct OutOfMemoryError {
    pub requested: u64,
    pub alignment: u64,
    pub attempts: usize,
}

/// Failure of a buffer or texture manager allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemoryError),
    #[error("{heap:?} descriptor heap has no room for {count} descriptor(s)")]
    OutOfDescriptors { heap: DescriptorHeapKind, count: u32 },
    #[error("{0} allocation already set")]
    AlreadyAllocated(&'static str),
    #[error("texture data is {actual} bytes, expected {expected}")]
    PixelDataSize { expected: usize, actual: usize },
    #[error(transparent)]
    Block(#[from] VirtualBlockError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failure of a frame lifecycle operation on the render interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("swapchain is not usable at {width}x{height}")]
    SwapchainInvalid { width: u32, height: u32 },
    #[error("invalid frame state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_failures_print_the_hresult_in_hex() {
        let err = DeviceError::Native {
            call: "CreateCommittedResource",
            hresult: 0x887a_0005,
        };
        assert_eq!(err.to_string(), "CreateCommittedResource failed with HRESULT 0x887a0005");

        let alloc: AllocError = err.clone().into();
        assert_eq!(alloc.to_string(), err.to_string());
    }
}
