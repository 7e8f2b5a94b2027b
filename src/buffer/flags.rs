use bitflags::bitflags;

/// Byte alignment applied to device allocations and to aligned uploads.
pub const PLATFORM_ALIGNMENT: usize = 16;

bitflags! {
    /// Creation flags handed to the device when a buffer is allocated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Elements are addressed by stride rather than by texel format.
        const STRUCTURED  = 1 << 0;
        const BIND_SRV    = 1 << 1;
        const BIND_UAV    = 1 << 2;
        /// Buffer can be copied out to a staging buffer.
        const UAV_OVERLAP = 1 << 3;
        /// UAV carries an append/consume counter.
        const UAV_COUNTER = 1 << 4;
        /// Host-visible memory, rewritten from the CPU every frame.
        const DYNAMIC     = 1 << 5;
        const CONSTANT    = 1 << 6;
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(12, 4), 12);
    }
}
