// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::task::{Wake, Waker};

use crate::park::Park;

/// A cloneable handle to a worker's [`Park`] implementation.
///
/// Cloned handles unpark the same target, and a `Parker` can be turned
/// into a [`Waker`] so futures driven by [`block_on`] can wake the
/// driving thread through the ordinary waker machinery.
///
/// [`block_on`]: crate::executor::Executor::block_on
#[derive(Clone)]
pub(crate) struct Parker(Arc<dyn Park>);

impl Parker {
    pub(crate) fn new(park: Arc<dyn Park>) -> Self {
        Self(park)
    }

    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    #[inline]
    pub(crate) fn unpark(&self) {
        self.0.unpark();
    }

    /// Converts this handle into a [`Waker`] that unparks the target.
    pub(crate) fn into_waker(self) -> Waker {
        Waker::from(Arc::new(UnparkOnWake(self)))
    }
}

impl std::fmt::Debug for Parker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Parker { .. }")
    }
}

struct UnparkOnWake(Parker);

impl Wake for UnparkOnWake {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::park::AutoResetEvent;

    #[test]
    fn parking_basically_works() {
        // Thread A parks itself after sending a handle to thread B, which
        // unparks it.
        let unparked = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let a = thread::spawn({
            let unparked = Arc::clone(&unparked);
            move || {
                let parker = Parker::new(Arc::new(AutoResetEvent::new()));

                tx.send(parker.clone()).unwrap();

                parker.park();
                unparked.store(true, Ordering::Release);
            }
        });

        let b = thread::spawn(move || {
            let parker = rx.recv().unwrap();
            parker.unpark();
        });

        a.join().unwrap();
        b.join().unwrap();

        assert!(unparked.load(Ordering::Acquire));
    }

    #[test]
    fn waker_unparks() {
        let parker = Parker::new(Arc::new(AutoResetEvent::new()));
        let waker = parker.clone().into_waker();

        let join = thread::spawn(move || {
            waker.wake();
        });

        // Either order works: the event latches the signal.
        parker.park();
        join.join().unwrap();
    }
}
