//! Interrupt Descriptor Table.
//!
//! Exception handlers (breakpoint, page fault, GPF, double fault) plus the
//! vectors the scheduler and SMP bring-up own outright: the clock tick, the
//! reschedule IPI (`cpu::smp::notify_cpu`'s target), and the broadcast
//! freeze IPI the panic path uses to stop every other CPU (§4.9, §4.15).

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

/// Legacy PIC timer vector (IRQ0 remapped to 32), kept while `arch::x86_64::timer`
/// still falls back to the 8259 PIT on platforms without a usable APIC timer.
pub const TIMER_VECTOR: u8 = 32;
/// Directed IPI a CPU sends to wake a sleeping peer whose ready queue just
/// gained an entry (§4.9 "Directed notify").
pub const RESCHEDULE_VECTOR: u8 = 0xF0;
/// Broadcast IPI the panic path uses to freeze every other CPU (§4.9
/// "Broadcast freeze", §4.15).
pub const FREEZE_VECTOR: u8 = 0xF1;
/// Local APIC spurious-interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR as usize].set_handler_fn(timer_interrupt_handler);
        idt[RESCHEDULE_VECTOR as usize].set_handler_fn(reschedule_handler);
        idt[FREEZE_VECTOR as usize].set_handler_fn(freeze_handler);
        idt[SPURIOUS_VECTOR as usize].set_handler_fn(spurious_handler);
        idt
    };
}

#[allow(dead_code)]
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    crate::panic::fatal_error(
        crate::panic::PanicCode::TrapNotHandled,
        stack_frame.instruction_pointer.as_u64(),
        0,
        0,
        0,
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    crate::panic::fatal_error(
        crate::panic::PanicCode::PageFaultNotHandled,
        fault_addr,
        error_code.bits(),
        stack_frame.instruction_pointer.as_u64(),
        0,
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    crate::panic::fatal_error(
        crate::panic::PanicCode::ExceptionNotHandled,
        error_code,
        stack_frame.instruction_pointer.as_u64(),
        0,
        0,
    );
}

/// Clock interrupt: acknowledge (APIC if initialized, else PIC) then hand off
/// to the scheduler's tick handler.
extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    if crate::arch::x86_64::apic::is_initialized() {
        crate::arch::x86_64::apic::send_eoi();
    } else {
        // SAFETY: PIC EOI is a fixed, always-valid I/O port write.
        unsafe {
            use x86_64::instructions::port::Port;
            let mut pic_command: Port<u8> = Port::new(0x20);
            pic_command.write(0x20);
        }
    }
    if crate::cpu::current_cpu_id() == 0 {
        crate::arch::x86_64::clock::poll_hpet_overflow();
    }
    crate::sched::scheduler::clock_tick();
}

/// Reschedule IPI: another CPU queued a thread onto this CPU and wants it to
/// re-evaluate its ready queue promptly rather than waiting for the next
/// clock tick. The scan itself happens on the next tick; this handler's job
/// is only to bring the CPU out of `hlt` if it was idling.
extern "x86-interrupt" fn reschedule_handler(_stack_frame: InterruptStackFrame) {
    crate::arch::x86_64::apic::send_eoi();
}

/// Broadcast freeze IPI: sent once, by whichever CPU wins the panic race, to
/// every other online CPU. Recipients never return from here.
extern "x86-interrupt" fn freeze_handler(_stack_frame: InterruptStackFrame) {
    crate::intrinsics::disable_interrupts();
    loop {
        crate::intrinsics::halt();
    }
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}
