//! # Kernel virtual-memory layout
//!
//! Fixed carve-up of the higher half. The HHDM base itself is chosen by
//! the bootloader; everything here must stay clear of the ranges Limine
//! may pick (it places the HHDM and the kernel image below and above
//! these windows respectively).

/// Base of the uncached alias of the direct map, used for MMIO.
pub const NON_CACHED_DIRECT_MAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Base of the kernel heap's virtual window.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_A000_0000_0000;

/// Size of the kernel heap's virtual window (not eagerly mapped; the heap
/// arena imports and maps it piecemeal).
pub const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Per-executor kernel stack size.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Size of the per-executor interrupt, double-fault and NMI stacks.
pub const INTERRUPT_STACK_SIZE: usize = 16 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE % 4096 == 0);
    assert!(INTERRUPT_STACK_SIZE % 4096 == 0);
    assert!(KERNEL_HEAP_BASE % 4096 == 0);
    assert!(KERNEL_HEAP_SIZE % 4096 == 0);
    assert!(NON_CACHED_DIRECT_MAP_BASE < KERNEL_HEAP_BASE);
    assert!(KERNEL_HEAP_BASE + KERNEL_HEAP_SIZE > KERNEL_HEAP_BASE);
};
