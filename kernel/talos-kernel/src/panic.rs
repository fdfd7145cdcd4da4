//! Kernel panic handler: report and halt.

use core::panic::PanicInfo;

use talos_core::arch::x86_64::instructions;
use talos_core::kfatal;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    kfatal!("kernel panic: {}", info);
    instructions::halt_loop();
}
