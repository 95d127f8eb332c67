// 2^53 - 1, the largest magnitude at which f64 still represents every integer.
const MAX_EXACT_INT_AS_FLOAT: f64 = 9_007_199_254_740_991_f64;

// Casting an out-of-range float to i64 is well-defined but silently clamps;
// refuse anything past the exact-integer range instead.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= MAX_EXACT_INT_AS_FLOAT {
        Some(f as i64)
    } else {
        None
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}
