// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr;

use crate::arch;

/// A value squeezed into a `usize` so it can ride through the context
/// switch in a single register.
pub type EncodedValue = usize;

/// Encodes `val` for transfer: register-sized values travel by value (as
/// the raw bytes of a word), larger ones as a pointer back to the
/// sender's stack. Logically takes ownership; the caller must not drop
/// `val` afterwards.
pub unsafe fn encode_val<T>(val: &mut ManuallyDrop<T>) -> EncodedValue {
    if size_of::<T>() <= size_of::<EncodedValue>() {
        let mut word: EncodedValue = 0;
        // Safety: T fits in the word; byte-wise copy has no alignment
        // requirement.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr::from_ref(val).cast::<u8>(),
                ptr::from_mut(&mut word).cast::<u8>(),
                size_of::<T>(),
            );
        }
        word
    } else {
        // The sender is parked in a switch call until the receiver has
        // decoded, so the pointee stays live.
        ptr::from_ref(val).expose_provenance()
    }
}

/// Decodes a value produced by [`encode_val`] on the other side of a
/// switch.
pub unsafe fn decode_val<T>(val: EncodedValue) -> T {
    if size_of::<T>() <= size_of::<EncodedValue>() {
        let mut out = MaybeUninit::<T>::uninit();
        // Safety: the word holds the raw bytes of a valid T.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr::from_ref(&val).cast::<u8>(),
                out.as_mut_ptr().cast::<u8>(),
                size_of::<T>(),
            );
            out.assume_init()
        }
    } else {
        // Safety: the encoder exposed this address and keeps the pointee
        // alive across the switch.
        unsafe { ptr::read(ptr::with_exposed_provenance(val)) }
    }
}

/// Pushes one machine word onto a downward-growing stack image. `None`
/// just reserves the slot.
#[inline]
pub unsafe fn push(sp: &mut usize, val: Option<usize>) {
    *sp -= size_of::<usize>();
    if let Some(val) = val {
        // Safety: the caller hands us a live, writable stack region whose
        // provenance was exposed when the mapping was set up.
        unsafe {
            ptr::with_exposed_provenance_mut::<usize>(*sp).write(val);
        }
    }
}

/// Writes `obj` onto the stack image, keeping the stack pointer aligned
/// to [`arch::STACK_ALIGNMENT`].
#[inline]
pub unsafe fn allocate_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    // Bound the entry object so it cannot eat a small stack whole.
    assert!(size_of::<T>() <= 1024, "type is too big to transfer");

    if align_of::<T>() > arch::STACK_ALIGNMENT {
        *sp -= size_of::<T>();
        *sp &= !(align_of::<T>() - 1);
    } else {
        // sp + sp_offset is aligned on entry; reserve enough below it
        // that the object fits and the final stack pointer lands back on
        // an alignment boundary.
        let reserved = (sp_offset + size_of::<T>()).next_multiple_of(arch::STACK_ALIGNMENT);
        *sp -= reserved - sp_offset;
    }
    // Safety: as for push; the slot was just reserved above.
    unsafe {
        ptr::with_exposed_provenance_mut::<T>(*sp).write(obj);
    }

    debug_assert_eq!(*sp % arch::STACK_ALIGNMENT, 0);
}
