//! Math utilites.

use num_traits::PrimInt;

/// Rounds up `src` to the next multiple of `factor`. A zero factor leaves `src` untouched.
pub fn round_up<T: PrimInt>(src: T, factor: T) -> T {
    if factor == T::zero() {
        return src;
    }
    round_up_div(src, factor) * factor
}

/// Performs integer division between a and b rounding up, instead of down
pub fn round_up_div<T: PrimInt>(a: T, b: T) -> T {
    (a + (b - T::one())) / b
}
