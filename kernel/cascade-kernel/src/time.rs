//! Monotonic time from the TSC.
//!
//! Stage 1 calibrates the invariant TSC against a fixed PIT one-shot and
//! records the boot timestamp; [`nanoseconds_since_boot`] is then a pair
//! of loads and a widening multiply. Good enough for the ACPI host's
//! timebase callback and boot diagnostics.

use crate::arch_x86::{inb, outb, rdtsc};
use core::sync::atomic::{AtomicU64, Ordering};
use log::info;

static BOOT_TSC: AtomicU64 = AtomicU64::new(0);
static TSC_HZ: AtomicU64 = AtomicU64::new(0);

const PIT_HZ: u64 = 1_193_182;
/// Calibration window: 10 ms of PIT ticks.
const CALIBRATION_TICKS: u16 = (PIT_HZ / 100) as u16;

/// Calibrate the TSC and mark "now" as the boot timestamp.
pub fn init() {
    let hz = calibrate_tsc();
    TSC_HZ.store(hz, Ordering::Release);
    BOOT_TSC.store(rdtsc(), Ordering::Release);
    info!("TSC frequency {} MHz", hz / 1_000_000);
}

/// Nanoseconds elapsed since [`init`] ran.
#[must_use]
pub fn nanoseconds_since_boot() -> u64 {
    let hz = TSC_HZ.load(Ordering::Acquire);
    if hz == 0 {
        return 0;
    }
    let elapsed = rdtsc().wrapping_sub(BOOT_TSC.load(Ordering::Acquire));
    (u128::from(elapsed) * 1_000_000_000 / u128::from(hz)) as u64
}

/// Count TSC cycles across one 10 ms PIT channel-2 one-shot.
fn calibrate_tsc() -> u64 {
    unsafe {
        // Gate channel 2 low, speaker off.
        let gate = inb(0x61) & !0x03;
        outb(0x61, gate);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        outb(0x43, 0xB0);
        outb(0x42, CALIBRATION_TICKS as u8);
        outb(0x42, (CALIBRATION_TICKS >> 8) as u8);

        // Raise the gate to start counting.
        outb(0x61, gate | 0x01);

        let start = rdtsc();
        // OUT2 (bit 5 of port 0x61) goes high at terminal count.
        while inb(0x61) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let end = rdtsc();

        outb(0x61, gate);
        (end - start) * 100
    }
}
