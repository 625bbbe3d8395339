#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Splits `items` into contiguous chunks of at most `chunk_size` elements.
///
/// Concatenating the chunks yields the input in its original order.
pub fn partition<T>(items: Vec<T>, chunk_size: usize) -> Result<Vec<Vec<T>>, PartitionError> {
    if chunk_size == 0 {
        return Err(PartitionError::InvalidChunkSize);
    }

    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut current_chunk = Vec::with_capacity(chunk_size.min(items.len()));

    for item in items {
        current_chunk.push(item);

        if current_chunk.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current_chunk, Vec::with_capacity(chunk_size)));
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    Ok(chunks)
}

/// Same as [`partition`] but borrows, returning the index range each chunk covers.
pub fn partition_ranges(
    len: usize,
    chunk_size: usize,
) -> Result<Vec<std::ops::Range<usize>>, PartitionError> {
    if chunk_size == 0 {
        return Err(PartitionError::InvalidChunkSize);
    }

    Ok((0..len).step_by(chunk_size).map(|start| start..(start + chunk_size).min(len)).collect())
}
