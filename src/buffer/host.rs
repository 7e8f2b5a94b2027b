use bytemuck::{Pod, Zeroable};

/// Alignment guaranteed for the start of every host-side byte arena.
pub const HOST_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(16))]
struct Block([u8; HOST_ALIGNMENT]);

/// Growable byte buffer whose storage starts on a [`HOST_ALIGNMENT`] boundary,
/// so it can be viewed as a slice of any `Pod` type with alignment up to 16.
#[derive(Clone, Default)]
pub struct AlignedBytes {
    blocks: Vec<Block>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        let mut bytes = Self::default();
        bytes.resize(len);
        bytes
    }

    /// New bytes are zeroed; bytes past `len` are dropped from the view.
    pub fn resize(&mut self, len: usize) {
        let blocks = len.div_ceil(HOST_ALIGNMENT);
        if blocks > self.blocks.len() {
            self.blocks.resize(blocks, Block::zeroed());
        }
        if len > self.len {
            let old = self.len;
            self.len = len;
            self.as_bytes_mut()[old..].fill(0);
        } else {
            self.len = len;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Block, u8>(&self.blocks)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Block, u8>(&mut self.blocks)[..self.len]
    }
}

/// CPU-side mirror of a device buffer, selected by the buffer policy.
pub trait HostData: Default {
    /// Sets the mirror length to `byte_len`.
    fn resize(&mut self, byte_len: usize);

    /// `None` when the policy carries no host mirror.
    fn get(&self) -> Option<&AlignedBytes>;

    fn get_mut(&mut self) -> Option<&mut AlignedBytes>;
}

#[derive(Default)]
pub struct NoHostData;

impl HostData for NoHostData {
    fn resize(&mut self, _byte_len: usize) {}

    fn get(&self) -> Option<&AlignedBytes> {
        None
    }

    fn get_mut(&mut self) -> Option<&mut AlignedBytes> {
        None
    }
}

#[derive(Default)]
pub struct HostDataUsed {
    data: AlignedBytes,
}

impl HostData for HostDataUsed {
    fn resize(&mut self, byte_len: usize) {
        self.data.resize(byte_len);
    }

    fn get(&self) -> Option<&AlignedBytes> {
        Some(&self.data)
    }

    fn get_mut(&mut self) -> Option<&mut AlignedBytes> {
        Some(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_bytes_start_on_alignment_boundary() {
        let bytes = AlignedBytes::zeroed(40);
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes.as_bytes().as_ptr() as usize % HOST_ALIGNMENT, 0);
        assert!(bytes.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn regrowing_zeroes_previously_dropped_bytes() {
        let mut bytes = AlignedBytes::zeroed(8);
        bytes.as_bytes_mut().fill(0xAB);
        bytes.resize(4);
        bytes.resize(8);
        assert_eq!(&bytes.as_bytes()[..4], &[0xAB; 4]);
        assert_eq!(&bytes.as_bytes()[4..], &[0; 4]);
    }

    #[test]
    fn empty_host_data_has_no_mirror() {
        let mut host = NoHostData;
        host.resize(64);
        assert!(host.get().is_none());
        assert!(host.get_mut().is_none());
    }

    #[test]
    fn used_host_data_tracks_resize() {
        let mut host = HostDataUsed::default();
        host.resize(64);
        assert_eq!(host.get().map(AlignedBytes::len), Some(64));
    }
}
