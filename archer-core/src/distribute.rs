//! Round-robin sharding of target lists across live workers.

/// Split `targets` into at most `workers` contiguous chunks of
/// `ceil(len / workers)` items; only the last chunk may be shorter.
///
/// A worker count of zero is treated as one.
pub fn distribute<T: Clone>(targets: &[T], workers: usize) -> Vec<Vec<T>> {
    if targets.is_empty() {
        return Vec::new();
    }
    let workers = workers.max(1);
    let chunk_size = targets.len().div_ceil(workers);
    targets
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}
