//! Branch-light binary search.

/// Returns the index of the first element that is not less than the probe,
/// over a sorted sequence of `len` elements.
///
/// `less(i)` must report whether element `i` is less than the probe. The
/// loop halves the remaining window without branching on the outcome,
/// which keeps the hot path free of hard-to-predict jumps.
pub fn lower_bound_by<F>(len: usize, mut less: F) -> usize
where
    F: FnMut(usize) -> bool,
{
    if len == 0 {
        return 0;
    }

    let mut remaining = len;
    let mut index = 0;

    loop {
        let half = remaining / 2;
        if half == 0 {
            break;
        }
        let mid = index + half;
        index = if less(mid) { mid } else { index };
        remaining -= half;
    }

    if less(index) {
        index += 1;
    }
    index
}
