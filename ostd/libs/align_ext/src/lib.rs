// SPDX-License-Identifier: MPL-2.0

//! Alignment helpers for unsigned integers.
//!
//! [`AlignExt`] covers power-of-two alignment (pages, segment boundaries),
//! while [`MultipleExt`] rounds to arbitrary multiples, which DMA transfer
//! granularities are not guaranteed to be.

#![cfg_attr(not(test), no_std)]

/// An extension trait for Rust integer types, including `u8`, `u16`, `u32`,
/// `u64`, and `usize`, to provide methods to make integers aligned to a
/// power of two.
pub trait AlignExt {
    /// Returns to the smallest number that is greater than or equal to
    /// `self` and is a multiple of the given power of two.
    ///
    /// The method panics if `power_of_two` is not a
    /// power of two or is smaller than 2 or the calculation overflows
    /// because `self` is too large.
    ///
    /// # Examples
    ///
    /// ```
    /// use crate::align_ext::AlignExt;
    /// assert_eq!(12usize.align_up(2), 12);
    /// assert_eq!(12usize.align_up(8), 16);
    /// ```
    fn align_up(self, power_of_two: Self) -> Self;

    /// Returns to the greatest number that is smaller than or equal to
    /// `self` and is a multiple of the given power of two.
    ///
    /// The method panics if `power_of_two` is not a
    /// power of two or is smaller than 2.
    ///
    /// # Examples
    ///
    /// ```
    /// use crate::align_ext::AlignExt;
    /// assert_eq!(12usize.align_down(4), 12);
    /// assert_eq!(12usize.align_down(16), 0);
    /// ```
    fn align_down(self, power_of_two: Self) -> Self;

    /// Returns whether `self` is a multiple of the given power of two.
    ///
    /// Unlike the other methods, an alignment of one is accepted and every
    /// number is aligned to it.
    fn is_aligned_to(self, power_of_two: Self) -> bool;

    /// Returns the distance from `self` to the next multiple of the given
    /// power of two that is strictly greater than `self`.
    ///
    /// This is the number of bytes left before crossing a boundary of size
    /// `power_of_two`.
    ///
    /// # Examples
    ///
    /// ```
    /// use crate::align_ext::AlignExt;
    /// assert_eq!(0x1ff0u64.distance_to_boundary(0x1000), 0x10);
    /// assert_eq!(0x2000u64.distance_to_boundary(0x1000), 0x1000);
    /// ```
    fn distance_to_boundary(self, power_of_two: Self) -> Self;
}

/// An extension trait for rounding unsigned integers to arbitrary multiples.
pub trait MultipleExt {
    /// Returns the greatest multiple of `multiple` that is smaller than or
    /// equal to `self`.
    ///
    /// A `multiple` of zero or one leaves `self` unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use crate::align_ext::MultipleExt;
    /// assert_eq!(100u32.round_down_to(12), 96);
    /// assert_eq!(100u32.round_down_to(0), 100);
    /// ```
    fn round_down_to(self, multiple: Self) -> Self;

    /// Returns `self` modulo `multiple`, or zero if `multiple` is zero.
    fn rem_of(self, multiple: Self) -> Self;
}

macro_rules! impl_align_ext {
    ($( $uint_type:ty ),+,) => {
        $(
            impl AlignExt for $uint_type {
                #[inline]
                fn align_up(self, align: Self) -> Self {
                    assert!(align.is_power_of_two() && align >= 2);
                    self.checked_add(align - 1).unwrap() & !(align - 1)
                }

                #[inline]
                fn align_down(self, align: Self) -> Self {
                    assert!(align.is_power_of_two() && align >= 2);
                    self & !(align - 1)
                }

                #[inline]
                fn is_aligned_to(self, align: Self) -> bool {
                    assert!(align.is_power_of_two());
                    self & (align - 1) == 0
                }

                #[inline]
                fn distance_to_boundary(self, align: Self) -> Self {
                    assert!(align.is_power_of_two());
                    align - (self & (align - 1))
                }
            }

            impl MultipleExt for $uint_type {
                #[inline]
                fn round_down_to(self, multiple: Self) -> Self {
                    self - self.rem_of(multiple)
                }

                #[inline]
                fn rem_of(self, multiple: Self) -> Self {
                    match multiple {
                        0 | 1 => 0,
                        m if m.is_power_of_two() => self & (m - 1),
                        m => self % m,
                    }
                }
            }
        )*
    }
}

impl_align_ext! {
    u8,
    u16,
    u32,
    u64,
    usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn align_up() {
        let cases = [(0usize, 2, 0), (1, 2, 2), (9, 2, 10), (15, 4, 16), (47, 8, 48)];
        for (n, a, expected) in cases {
            assert_eq!(n.align_up(a), expected);
        }
    }

    #[test]
    fn align_down() {
        let cases = [(0usize, 2, 0), (1, 2, 0), (9, 2, 8), (21, 4, 20), (50, 8, 48)];
        for (n, a, expected) in cases {
            assert_eq!(n.align_down(a), expected);
        }
    }

    #[test]
    #[should_panic]
    fn align_up_rejects_non_power_of_two() {
        let _ = 10u64.align_up(6);
    }

    #[test]
    fn boundary_distance() {
        assert_eq!(0u64.distance_to_boundary(0x1000), 0x1000);
        assert_eq!(0xfffu64.distance_to_boundary(0x1000), 1);
        assert_eq!(0x1001u64.distance_to_boundary(0x1000), 0xfff);
        assert!(0x3000u64.is_aligned_to(0x1000));
        assert!(!0x3008u64.is_aligned_to(0x10));
        assert!(7u64.is_aligned_to(1));
    }

    #[test]
    fn arbitrary_multiples() {
        assert_eq!(4096u32.round_down_to(3), 4095);
        assert_eq!(4096u32.rem_of(3), 1);
        assert_eq!(4100u32.round_down_to(512), 4096);
        assert_eq!(4100u32.rem_of(512), 4);
        assert_eq!(77u32.round_down_to(1), 77);
        assert_eq!(77u32.rem_of(0), 0);
    }
}
