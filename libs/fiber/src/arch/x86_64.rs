// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System-V x86_64 context switching.
//!
//! Stack layout of a suspended fiber, from the stack base (highest
//! address) downwards:
//!
//! ```text
//! +--------------+  <- stack base
//! | Initial func |
//! +--------------+
//! | Parent link  |  <- resumer's stack pointer, rewritten on every resume
//! +--------------+
//! |     ...      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RBP    |  <- saved stack pointer
//! +--------------+
//! ```
//!
//! While a fiber runs, the parent's stack holds the resumer's RBX, a
//! return address produced by the `call` in [`switch_and_link`] and the
//! resumer's RBP, which together form a frame record the unwinder can walk
//! through.

use core::arch::{asm, naked_asm};

use crate::stack::{FiberStack, StackPointer};
use crate::utils::{EncodedValue, allocate_obj_on_stack, push};

pub const STACK_ALIGNMENT: usize = 16;

/// Lays out a fresh fiber stack so that the first [`switch_and_link`]
/// enters `func` through the init trampoline.
#[inline]
pub unsafe fn init_stack<T>(
    stack: &dyn FiberStack,
    func: unsafe extern "C-unwind" fn(arg: EncodedValue, sp: &mut StackPointer, obj: *mut T) -> !,
    obj: T,
) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let mut sp = stack.top().get();

        // The address of the initial function, read and jumped to by
        // stack_init_trampoline().
        push(&mut sp, Some(func as usize));

        // Parent link placeholder, filled in on every switch into the
        // fiber.
        push(&mut sp, None);

        // The entry object, whose address the trampoline passes to `func`.
        allocate_obj_on_stack(&mut sp, 16, obj);

        // The address called by switch_and_link() on the first resume.
        push(&mut sp, Some(stack_init_trampoline as usize));

        StackPointer::new_unchecked(sp)
    }
}

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        ".cfi_startproc",
        // Reached via the CALL in switch_and_link() the first time a fiber
        // is resumed. Register state at this point:
        // - RSP points to the top of the parent stack.
        // - RBP holds its value from the parent context.
        // - RDX points to the top of our stack.
        // - RSI points to the base of our stack.
        // - RDI contains the argument passed from switch_and_link.
        //
        // Save the parent's RBP next to the return address pushed by the
        // CALL; the pair forms a frame record for the frame pointer chain.
        "push rbp",
        // Fill in the parent link near the base of our stack.
        "mov [rsi - 16], rsp",
        // Adjust RSI from the stack base to the parent link, the second
        // argument of the entry function.
        "sub rsi, 16",
        // Switch to the fiber stack, skipping the trampoline address slot.
        "lea rsp, [rdx + 8]",
        // Point the frame pointer at the parent link for the unwind
        // instructions below.
        "mov rbp, rsi",
        // Teach the unwinder where the parent context's Canonical Frame
        // Address is: read the parent link through RBP, then skip the 3
        // words saved on the parent stack.
        ".cfi_escape 0x0f,  /* DW_CFA_def_cfa_expression */\
        5,                  /* the byte length of this expression */\
        0x76, 0x00,         /* DW_OP_breg6 (rbp + 0) */\
        0x06,               /* DW_OP_deref */\
        0x23, 0x18          /* DW_OP_plus_uconst 24 */",
        // ...and how to restore the registers saved there, as offsets from
        // that CFA.
        ".cfi_offset rbx, -8",
        ".cfi_offset rip, -16",
        ".cfi_offset rbp, -24",
        // Third argument: the entry object, sitting right at RSP now.
        "mov rdx, rsp",
        // Enter the initial function with a hand-made return address
        // instead of a CALL, so the CPU's return predictor is not left
        // misaligned by the RET executed later in switch_yield() or
        // switch_and_reset(). Those functions are #[inline(always)] for
        // the same reason.
        "lea rcx, [rip + 2f]",
        "push rcx",
        // init_stack() put the initial function right above the parent
        // link.
        "jmp [rsi + 8]",
        // Never reached: the initial function cannot return (it ends in
        // switch_and_reset).
        "2:",
        ".cfi_endproc",
    }
}

/// Switches to a fiber, storing a link back to the current stack so the
/// fiber can switch back (and unwinding can cross the boundary).
///
/// Returns the value the fiber passed out and, if it suspended, its new
/// saved stack pointer.
#[inline]
pub unsafe fn switch_and_link(
    arg0: EncodedValue,
    sp: StackPointer,
    top_of_stack: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save RBX manually; it is an LLVM-reserved register and
            // cannot be named in the clobber list. RBP is saved later, on
            // the other side of the CALL, to form a valid frame record.
            "push rbx",

            // DW_CFA_GNU_args_size 0: neutralise any args_size a previous
            // call in this function may have left behind, for landing-pad
            // correctness.
            ".cfi_escape 0x2e, 0x00",

            // Push our return address and jump to the resume address at
            // the top of the fiber stack (the init trampoline on first
            // resume, the label in switch_yield afterwards).
            "call [rdx]",

            // Back from the fiber. Register state:
            // - RSP: our stack, return address and RBP already popped.
            // - RSI: the fiber's saved stack pointer, or 0 if it finished.
            // - RDI: the value passed out of the fiber.

            "pop rbx",

            // RDI carries the argument in and out; it is the first-arg
            // register of the sysv64 ABI and is passed straight through.
            inlateout("rdi") arg0 => ret_val,
            // The fiber's saved stack pointer comes back in RSI; must
            // match switch_yield() and switch_and_reset().
            lateout("rsi") ret_sp,
            // The stack base rides in RSI so the first switch can hand it
            // to the entry function; the trampoline turns it into the
            // parent-link address.
            in("rsi") top_of_stack.get() as u64,
            // Target stack pointer; must match the register switch_yield()
            // expects.
            in("rdx") sp.get() as u64,
            // Everything else is clobbered. clobber_abi covers the
            // caller-saved half; the remaining callee-saved registers are
            // listed explicitly (except the LLVM-reserved RBX/RBP handled
            // above).
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current fiber, returning to the context stored in the
/// parent link. Must only be called on a fiber stack.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save RBP and RBX; both are LLVM-reserved and cannot go in
            // the clobber list.
            "push rbp",
            "push rbx",

            // Push the address switch_and_link() will CALL on the next
            // resume.
            "lea rax, [rip + 2f]",
            "push rax",

            // Hand our stack pointer out through RSI...
            "mov rsi, rsp",

            // ...and switch to the parent context.
            "mov rsp, [rdx]",
            "pop rbp",

            // DW_CFA_GNU_args_size 0, see switch_and_link().
            ".cfi_escape 0x2e, 0x00",

            // Return into switch_and_link() right after its CALL.
            "ret",

            // Resume point, reached via the CALL in switch_and_link().
            // Register state as in the init trampoline:
            // - RSP: top of the parent stack.
            // - RDX: top of our stack, including the resume address.
            // - RSI: base of our stack.
            // - RDI: the argument from switch_and_link.
            "2:",

            // Save the parent's RBP, completing its frame record.
            "push rbp",

            // Refresh the parent link near our stack base.
            "mov [rsi - 16], rsp",

            // Back onto our own stack, skipping the resume address.
            "lea rsp, [rdx + 8]",

            "pop rbx",
            "pop rbp",

            inlateout("rdi") arg => ret_val,
            // The parent link; any register works, RDX is what the other
            // side uses.
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
            options(may_unwind)
        }
    }

    ret_val
}

/// Leaves a finishing fiber for good: switches to the parent context and
/// reports a zero stack pointer so the fiber is marked done.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "mov rsp, [{parent_link}]",
            "pop rbp",

            // The top of the parent stack holds the return address pushed
            // by the CALL in switch_and_link().
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // A zero stack pointer tells the resumer this fiber is done.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
