/// Number of thread groups of `block_size` threads needed to cover `threads`.
pub fn blocks_for_threads(threads: u32, block_size: u32) -> u32 {
    assert!(block_size > 0, "thread group size must be non-zero");
    threads.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_partial_groups_up() {
        assert_eq!(blocks_for_threads(0, 64), 0);
        assert_eq!(blocks_for_threads(1, 64), 1);
        assert_eq!(blocks_for_threads(64, 64), 1);
        assert_eq!(blocks_for_threads(65, 64), 2);
        assert_eq!(blocks_for_threads(1000, 256), 4);
    }
}
