//! Fixed-size contiguous chunking.

use crate::error::BatchingError;

/// Split `items` into consecutive chunks of at most `limit` elements.
///
/// Order is preserved and only the last chunk may be shorter.
pub fn contiguous_chunks<T>(items: &[T], limit: usize) -> Result<Vec<&[T]>, BatchingError> {
    if limit == 0 {
        return Err(BatchingError::ZeroBatchSize);
    }
    Ok(items.chunks(limit).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let items: Vec<u32> = (0..6).collect();
        let chunks = contiguous_chunks(&items, 3).unwrap();
        assert_eq!(chunks, vec![&[0, 1, 2][..], &[3, 4, 5][..]]);
    }

    #[test]
    fn test_short_last_chunk() {
        let items: Vec<u32> = (0..7).collect();
        let chunks = contiguous_chunks(&items, 3).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], &[6]);
    }

    #[test]
    fn test_empty_input() {
        let items: Vec<u32> = vec![];
        assert!(contiguous_chunks(&items, 3).unwrap().is_empty());
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert_eq!(
            contiguous_chunks(&[1, 2], 0),
            Err(BatchingError::ZeroBatchSize)
        );
    }
}
