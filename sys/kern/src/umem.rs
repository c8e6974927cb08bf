// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for interacting with unprivileged/user memory.
//!
//! Tasks on this platform share one flat address space with the kernel; there
//! is no MPU standing between a task pointer and kernel data. The types here
//! therefore provide _structural_ validation (alignment, wrap-around) and a
//! clearly marked unsafe boundary for the actual access, rather than a proof
//! of access rights.

use core::marker::PhantomData;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use abi::UsageError;

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by a task, and is intended to refer to
/// memory that task controls -- for instance, as a place where the kernel can
/// deposit a received queue item. However, the `USlice` type itself simply
/// represents an _allegation_ from the task that a section of address space is
/// suitable; it does _not_ demonstrate that the task has access to that
/// memory.
///
/// Having a `USlice<T>` tells you the following:
///
/// - Some task has claimed it has access to a section of address space
///   (delimited by the `USlice`).
/// - The base of the section is correctly aligned for type `T`.
/// - The section does not wrap around the end of the address space.
///
/// To actually access the memory referred to by a `USlice`, you must go
/// through `assume_readable` / `assume_writable` and meet their contracts.
///
/// Note that this same `USlice` type is used for both readable and read-write
/// contexts -- there is no `USliceMut`. So far, this has not seemed like a
/// decision that will generate bugs.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: usize,
    /// Number of `T` elements in the slice.
    length: usize,
    /// since we don't actually use T...
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not overlap or touch the
    /// top of the address space, and if `base_address` is correctly aligned
    /// for `T`.
    ///
    /// This method will categorically reject zero-sized T.
    pub fn from_raw(
        base_address: usize,
        length: usize,
    ) -> Result<Self, UsageError> {
        // NOTE: the properties checked here are critical for the correctness
        // of this type. Think carefully before loosening any of them, or
        // adding a second way to construct a USlice.

        // ZST check, should resolve at compile time:
        uassert!(core::mem::size_of::<T>() != 0);

        // Alignment check:
        if !base_address.is_multiple_of(core::mem::align_of::<T>()) {
            return Err(UsageError::InvalidSlice);
        }
        // Check that a slice of `length` `T`s can even exist starting at
        // `base_address`, without wrapping around.
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(UsageError::InvalidSlice)?;
        // Note: this subtraction cannot underflow. You can subtract any usize
        // from usize::MAX.
        let highest_possible_base = usize::MAX - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: PhantomData,
            })
        } else {
            Err(UsageError::InvalidSlice)
        }
    }

    /// Returns `true` if this slice is zero-length, `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns the bottom address of this slice as a `usize`.
    pub fn base_addr(&self) -> usize {
        self.base_address
    }
}

impl<T> USlice<T>
where
    T: FromBytes + Immutable + KnownLayout,
{
    /// Converts this into an _actual_ slice that can be directly read by the
    /// kernel.
    ///
    /// # Safety
    ///
    /// This operation is totally unchecked, so to use it safely, you must
    /// first convince yourself of the following.
    ///
    /// 1. That the memory region this `USlice` describes is actual memory.
    /// 2. That this memory is legally readable by whatever task you're doing
    ///    work on behalf of.
    /// 3. That it contains bytes that are valid `T`s. (The `FromBytes,
    ///    Immutable, KnownLayout` constraint ensures this statically.)
    /// 4. That it does not alias any slice you intend to `&mut`-reference
    ///    with `assume_writable`, or any kernel memory.
    pub unsafe fn assume_readable(&self) -> &[T] {
        // Safety: this function's contract ensures that the slice we produce
        // here is valid.
        unsafe {
            core::slice::from_raw_parts(
                self.base_address as *const T,
                self.length,
            )
        }
    }

    /// Converts this into an _actual_ slice that can be directly read and
    /// written by the kernel.
    ///
    /// # Safety
    ///
    /// This operation is totally unchecked, so to use it safely, you must
    /// first convince yourself of the following:
    ///
    /// 1. That the memory region this `USlice` describes is actual memory.
    /// 2. That this memory is legally writable by whatever task you're doing
    ///    work on behalf of.
    /// 3. That it contains bytes that are valid `T`s. (The `FromBytes,
    ///    Immutable, KnownLayout` constraint ensures this statically.)
    /// 4. That it does not alias any other slice you intend to access, or any
    ///    kernel memory.
    pub unsafe fn assume_writable(&mut self) -> &mut [T] {
        // Safety: this function's contract ensures that the slice we produce
        // here is valid.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base_address as *mut T,
                self.length,
            )
        }
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Can't `derive(Debug)` for `USlice` because that puts a `Debug` requirement
/// on `T`, and that's silly.
impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base_address", &self.base_address)
            .field("length", &self.length)
            .finish()
    }
}

/// Copies bytes out of task memory at `from` into the kernel buffer `to`.
///
/// The actual number of bytes copied is `min(from.len(), to.len())`, and is
/// returned.
///
/// # Safety
///
/// `from` must meet the contract of [`USlice::assume_readable`] for the task
/// that produced it.
pub unsafe fn copy_from_task(from: &USlice<u8>, to: &mut [u8]) -> usize {
    let n = from.len().min(to.len());
    // Safety: delegated to our caller's contract.
    let src = unsafe { from.assume_readable() };
    to[..n].copy_from_slice(&src[..n]);
    n
}

/// Copies bytes from the kernel buffer `from` into task memory at `to`.
///
/// The actual number of bytes copied is `min(from.len(), to.len())`, and is
/// returned.
///
/// # Safety
///
/// `to` must meet the contract of [`USlice::assume_writable`] for the task
/// that produced it.
pub unsafe fn copy_to_task(from: &[u8], to: &mut USlice<u8>) -> usize {
    let n = from.len().min(to.len());
    // Safety: delegated to our caller's contract.
    let dst = unsafe { to.assume_writable() };
    dst[..n].copy_from_slice(&from[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_may_not_wrap_the_address_space() {
        assert_eq!(
            USlice::<u8>::from_raw(usize::MAX - 4, 16).unwrap_err(),
            UsageError::InvalidSlice,
        );
        // Touching the very top of the address space is also out, so that
        // one-past-the-end pointers always exist.
        assert_eq!(
            USlice::<u8>::from_raw(usize::MAX - 15, 16).unwrap_err(),
            UsageError::InvalidSlice,
        );
        assert!(USlice::<u8>::from_raw(usize::MAX - 16, 16).is_ok());
    }

    #[test]
    fn misaligned_bases_are_rejected() {
        assert_eq!(
            USlice::<u64>::from_raw(0x1001, 1).unwrap_err(),
            UsageError::InvalidSlice,
        );
        assert!(USlice::<u64>::from_raw(0x1008, 1).is_ok());
    }

    #[test]
    fn copies_clamp_to_the_shorter_buffer() {
        let src = [0xAAu8; 8];
        let from =
            USlice::<u8>::from_raw(src.as_ptr() as usize, src.len()).unwrap();
        let mut kbuf = [0u8; 4];
        // Safety: `from` denotes `src`, a live local array.
        let n = unsafe { copy_from_task(&from, &mut kbuf) };
        assert_eq!(n, 4);
        assert_eq!(kbuf, [0xAA; 4]);

        let mut dst = [0u8; 8];
        let mut to =
            USlice::<u8>::from_raw(dst.as_mut_ptr() as usize, 3).unwrap();
        // Safety: `to` denotes a prefix of `dst`, a live local array.
        let n = unsafe { copy_to_task(&[1, 2, 3, 4], &mut to) };
        assert_eq!(n, 3);
        assert_eq!(dst, [1, 2, 3, 0, 0, 0, 0, 0]);
    }
}
