// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![feature(asm_unwind)]

//! Stack switching support for suspendable tasks.
//!
//! This crate provides [`Fiber`], a stackful coroutine running on its own
//! guard-paged machine stack. A fiber can suspend itself mid-execution
//! through its [`Suspend`] handle and be resumed later, possibly from a
//! different OS thread; the saved machine state (callee-saved registers,
//! stack pointer, instruction pointer) lives entirely on the fiber stack.
//!
//! The switching protocol keeps a *parent link* near the base of the fiber
//! stack: every resume stores the resumer's stack pointer there, so a
//! suspending (or returning) fiber always knows where to switch back to,
//! and so unwinding can walk across the stack boundary.

mod arch;
pub mod stack;
mod utils;

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use core::ptr;

use crate::stack::{FiberStack, StackPointer};
use crate::utils::EncodedValue;

/// Value returned from resuming a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FiberResult<Yield, Return> {
    /// The fiber suspended itself through its [`Suspend`] handle.
    Yield(Yield),

    /// The fiber returned from its entry function and is now finished.
    Return(Return),
}

impl<Yield, Return> FiberResult<Yield, Return> {
    /// Returns the `Yield` value as an `Option<Yield>`.
    pub fn into_yield(self) -> Option<Yield> {
        match self {
            FiberResult::Yield(val) => Some(val),
            FiberResult::Return(_) => None,
        }
    }

    /// Returns the `Return` value as an `Option<Return>`.
    pub fn into_return(self) -> Option<Return> {
        match self {
            FiberResult::Yield(_) => None,
            FiberResult::Return(val) => Some(val),
        }
    }
}

/// A suspendable computation with its own private machine stack.
///
/// `Input` is passed into the fiber on every [`resume`][Fiber::resume] and
/// handed out by [`Suspend::suspend`]; `Yield` travels the other way.
pub struct Fiber<Input, Yield, Return, S: FiberStack> {
    /// Stack that the fiber is executing on.
    stack: S,
    /// Stack pointer at which the suspended state is held. `None` once the
    /// fiber has completed execution.
    stack_ptr: Option<StackPointer>,
    /// The stack pointer value the fiber was created with. Suspending
    /// pushes state, so a started fiber can never be back at this value.
    initial_stack_ptr: StackPointer,
    /// We want to be covariant over Yield and Return, and contravariant
    /// over Input.
    _m1: PhantomData<fn(Input) -> FiberResult<Yield, Return>>,
    /// Fiber must be !Send by default; a scheduler that guarantees
    /// exclusive resumption may assert otherwise around it.
    _m2: PhantomData<*mut ()>,
}

impl<Input, Yield, Return, S: FiberStack> Fiber<Input, Yield, Return, S> {
    /// Creates a new fiber executing `func` on the provided stack.
    ///
    /// The fiber does not run until [`resume`][Fiber::resume] is called.
    pub fn with_stack<F>(stack: S, func: F) -> Self
    where
        F: FnOnce(Input, &Suspend<Input, Yield>) -> Return,
        F: 'static,
        Input: 'static,
        Yield: 'static,
        Return: 'static,
    {
        unsafe extern "C-unwind" fn fiber_func<Input, Yield, Return, F>(
            input: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut MaybeUninit<F>,
        ) -> !
        where
            F: FnOnce(Input, &Suspend<Input, Yield>) -> Return,
        {
            // Safety: the trampoline passes the pointers init_stack set up.
            unsafe {
                // The Suspend is a #[repr(transparent)] wrapper around the
                // parent link on the stack.
                let suspend = &*(ptr::from_mut(parent_link).cast::<Suspend<Input, Yield>>());

                let input: Input = utils::decode_val(input);

                let result = (*obj).assume_init_read()(input, suspend);

                // Hand the return value to the parent context and mark the
                // fiber as finished.
                let mut result = ManuallyDrop::new(result);
                arch::switch_and_reset(utils::encode_val(&mut result), suspend.stack_ptr.as_ptr());
            }
        }

        // Safety: the stack is fresh and exclusively ours.
        unsafe {
            // Write the entry function object to the stack and arrange for
            // fiber_func to receive its address on the first resume.
            let stack_ptr = arch::init_stack(
                &stack,
                fiber_func::<Input, Yield, Return, F>,
                MaybeUninit::new(func),
            );

            Self {
                stack,
                stack_ptr: Some(stack_ptr),
                initial_stack_ptr: stack_ptr,
                _m1: PhantomData,
                _m2: PhantomData,
            }
        }
    }

    /// Resumes the fiber, passing `input` to it.
    ///
    /// `input` is returned by the [`Suspend::suspend`] call the fiber is
    /// currently blocked in (or becomes the entry argument on first
    /// resume).
    ///
    /// # Panics
    ///
    /// Panics if the fiber has already completed.
    pub fn resume(&mut self, input: Input) -> FiberResult<Yield, Return> {
        let mut input = ManuallyDrop::new(input);

        let stack_ptr = self
            .stack_ptr
            .take()
            .expect("attempt to resume a completed fiber");

        // Safety: stack_ptr was produced by init_stack or a previous
        // suspension on this same stack.
        unsafe {
            let (result, stack_ptr) =
                arch::switch_and_link(utils::encode_val(&mut input), stack_ptr, self.stack.top());

            self.stack_ptr = stack_ptr;

            // A present stack pointer means the fiber suspended; an absent
            // one means it ran to completion.
            if stack_ptr.is_some() {
                FiberResult::Yield(utils::decode_val(result))
            } else {
                FiberResult::Return(utils::decode_val(result))
            }
        }
    }

    /// Returns whether this fiber has been resumed at least once.
    pub fn started(&self) -> bool {
        self.stack_ptr != Some(self.initial_stack_ptr)
    }

    /// Returns whether this fiber has finished executing.
    ///
    /// A fiber that has returned from its entry function can no longer be
    /// resumed.
    pub fn done(&self) -> bool {
        self.stack_ptr.is_none()
    }

    /// Forcibly marks the fiber as having completed, even if it is
    /// currently suspended in the middle of a function.
    ///
    /// # Safety
    ///
    /// This is equivalent to a `longjmp` all the way back to the initial
    /// function of the fiber, so the same rules apply: nothing still on
    /// the fiber's stack may need to run `Drop` code. The entry closure
    /// of a never-started fiber is leaked.
    pub unsafe fn force_reset(&mut self) {
        self.stack_ptr = None;
    }

    /// Recovers the stack of a finished fiber, e.g. to return it to a free
    /// pool.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has not finished executing.
    pub fn into_stack(self) -> S {
        assert!(self.done(), "fiber still suspended, cannot take its stack");

        // Safety: `self` is forgotten right after the read, so the stack is
        // moved out exactly once and Drop never observes it.
        unsafe {
            let stack = ptr::read(&self.stack);
            mem::forget(self);
            stack
        }
    }
}

impl<Input, Yield, Return, S: FiberStack> Drop for Fiber<Input, Yield, Return, S> {
    fn drop(&mut self) {
        // A suspended fiber still has live frames on its stack which we
        // cannot unwind from here.
        assert!(self.done(), "fiber dropped while suspended");
    }
}

/// Handle through which a running fiber suspends itself.
///
/// A reference to it is passed to the fiber's entry function; it stays
/// valid for the fiber's whole lifetime.
#[repr(transparent)]
pub struct Suspend<Input, Yield> {
    // This is the parent link slot near the stack base, updated on every
    // resume. #[repr(transparent)] lets fiber_func derive it from the
    // parent link pointer directly.
    stack_ptr: Cell<StackPointer>,
    marker: PhantomData<fn(Yield) -> Input>,
}

impl<Input, Yield> Suspend<Input, Yield> {
    /// Suspends the calling fiber, yielding `val` to whoever called
    /// [`Fiber::resume`].
    ///
    /// Returns the `Input` passed to the next `resume` call.
    pub fn suspend(&self, val: Yield) -> Input {
        // Safety: the parent link always holds the resumer's stack pointer
        // while the fiber is running.
        unsafe {
            let mut val = ManuallyDrop::new(val);
            let result = arch::switch_yield(utils::encode_val(&mut val), self.stack_ptr.as_ptr());

            utils::decode_val(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::stack::DefaultFiberStack;
    use crate::{Fiber, FiberResult, Suspend};

    #[test]
    fn yield_loop() {
        let stack = DefaultFiberStack::default();

        let mut fiber = Fiber::with_stack(stack, |input, suspend| {
            assert_eq!(input, 100);

            for i in 0..5 {
                let input = suspend.suspend(i);
                assert_eq!(input, 100 + i + 1);
            }
        });

        for i in 0..5 {
            assert_eq!(fiber.resume(100 + i).into_yield().unwrap(), i);
        }
        assert!(fiber.resume(105).into_return().is_some());
        assert!(fiber.done());
    }

    #[test]
    fn immediate_return() {
        let stack = DefaultFiberStack::default();

        let mut fiber =
            Fiber::with_stack(stack, |input: u64, _suspend: &Suspend<u64, ()>| input * 2);
        assert_eq!(fiber.resume(21), FiberResult::Return(42));
    }

    #[test]
    fn stack_reuse() {
        let stack = DefaultFiberStack::default();

        let mut fiber = Fiber::with_stack(stack, |(), _suspend: &Suspend<(), ()>| ());
        fiber.resume(()).into_return().unwrap();

        // The recovered stack must be good for another fiber.
        let stack = fiber.into_stack();
        let mut fiber = Fiber::with_stack(stack, |n: u32, suspend| {
            let m = suspend.suspend(n + 1);
            n + m
        });
        assert_eq!(fiber.resume(1), FiberResult::Yield(2));
        assert_eq!(fiber.resume(10), FiberResult::Return(11));
    }

    #[test]
    fn large_values_cross_the_switch() {
        // Values wider than a usize travel by reference through the
        // encoder; make sure nothing is torn.
        let stack = DefaultFiberStack::default();

        let mut fiber = Fiber::with_stack(stack, |input: [u64; 4], suspend| {
            let next = suspend.suspend(input.map(|v| v + 1));
            next.iter().sum::<u64>()
        });

        assert_eq!(
            fiber.resume([1, 2, 3, 4]).into_yield().unwrap(),
            [2, 3, 4, 5]
        );
        assert_eq!(fiber.resume([10, 20, 30, 40]), FiberResult::Return(100));
    }

    #[test]
    fn local_state_survives_suspension() {
        let stack = DefaultFiberStack::default();

        let mut fiber = Fiber::with_stack(stack, |(), suspend| {
            let mut acc: u64 = 0xdead_beef;
            for _ in 0..3 {
                suspend.suspend(());
                acc = acc.rotate_left(13) ^ 0x1234_5678;
            }
            acc
        });

        let mut expect: u64 = 0xdead_beef;
        for _ in 0..3 {
            assert!(matches!(fiber.resume(()), FiberResult::Yield(())));
            expect = expect.rotate_left(13) ^ 0x1234_5678;
        }
        assert_eq!(fiber.resume(()), FiberResult::Return(expect));
    }

    #[test]
    #[should_panic(expected = "attempt to resume a completed fiber")]
    fn resume_after_return_panics() {
        let stack = DefaultFiberStack::default();
        let mut fiber = Fiber::with_stack(stack, |(), _suspend: &Suspend<(), ()>| ());
        fiber.resume(());
        fiber.resume(());
    }
}
