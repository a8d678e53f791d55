/// Download block size: 64 KiB. Read markers count blocks of this size.
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Number of blocks needed to hold `size` bytes.
pub fn num_blocks(size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Byte range `[start, end)` covered by `num_blocks` blocks starting at the
/// 1-based `block_num`, clamped to `file_len`. `None` when the range starts
/// past the end of the file or the request is empty.
pub fn block_range(block_num: u64, num_blocks: u64, file_len: u64) -> Option<(u64, u64)> {
    if block_num == 0 || num_blocks == 0 {
        return None;
    }
    let start = (block_num - 1).checked_mul(BLOCK_SIZE)?;
    if start >= file_len {
        return None;
    }
    let end = start.saturating_add(num_blocks.saturating_mul(BLOCK_SIZE)).min(file_len);
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_blocks() {
        assert_eq!(num_blocks(0), 0);
        assert_eq!(num_blocks(1), 1);
        assert_eq!(num_blocks(BLOCK_SIZE), 1);
        assert_eq!(num_blocks(BLOCK_SIZE + 1), 2);
    }

    #[test]
    fn test_block_range_clamps_last_block() {
        let len = BLOCK_SIZE * 2 + 10;
        assert_eq!(block_range(1, 1, len), Some((0, BLOCK_SIZE)));
        assert_eq!(block_range(3, 5, len), Some((BLOCK_SIZE * 2, len)));
        assert_eq!(block_range(4, 1, len), None);
        assert_eq!(block_range(0, 1, len), None);
    }
}
