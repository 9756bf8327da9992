/// Align `value` upwards to `align`.
///
/// Requires that `align` is a power of two and that the result does not overflow.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Overflow-checked variant of [`align_up`].
#[inline(always)]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

/// Round `value` up to the next multiple of `granularity`, which need not be
/// a power of two.
#[inline]
pub const fn round_up_to(value: usize, granularity: usize) -> Option<usize> {
    debug_assert!(granularity > 0);
    let rem = value % granularity;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(granularity - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(7, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(100, 16), 112);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 16), None);
        assert_eq!(checked_align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, 4096), 0);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096 + 17, 4096), 4096);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(64, 32));
        assert!(!is_aligned(48, 32));
        assert!(is_aligned(0, 1));
    }

    #[test]
    fn test_round_up_to() {
        assert_eq!(round_up_to(0, 3000), Some(0));
        assert_eq!(round_up_to(1, 3000), Some(3000));
        assert_eq!(round_up_to(6000, 3000), Some(6000));
        assert_eq!(round_up_to(6001, 3000), Some(9000));
        assert_eq!(round_up_to(usize::MAX, 3000), None);
    }
}
