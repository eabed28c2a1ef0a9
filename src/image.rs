//! Fetched firmware bytes, ready to be written.

use std::borrow::Cow;
use std::fmt;

/// Bytes destined for one flash address.
#[derive(Clone, Eq, PartialEq)]
pub struct FlashSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// All the segments of one firmware, in the order they must be written.
///
/// Built once per provisioning operation and never modified afterwards.
#[derive(Clone, Eq, PartialEq)]
pub struct FirmwareImage {
    segments: Vec<FlashSegment>,
}
impl FirmwareImage {
    pub fn new(segments: Vec<FlashSegment>) -> Self {
        FirmwareImage { segments }
    }

    pub fn segments(&self) -> &[FlashSegment] {
        &self.segments
    }

    /// Total number of bytes over all segments.
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.data.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The image as one continuous stream, segments in order. Only copies
    /// when there is more than one segment.
    pub fn contiguous(&self) -> Cow<'_, [u8]> {
        match self.segments.as_slice() {
            [] => Cow::Borrowed(&[]),
            [single] => Cow::Borrowed(single.data.as_slice()),
            many => Cow::Owned(many.iter().flat_map(|s| s.data.iter().copied()).collect()),
        }
    }
}

// Images are large; only show their shape.
impl fmt::Debug for FlashSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashSegment")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.data.len())
            .finish()
    }
}
impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.segments.iter()).finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn length_sums_segments() {
    let image = FirmwareImage::new(vec![
        FlashSegment {
            address: 0,
            data: vec![1; 10],
        },
        FlashSegment {
            address: 0x8000,
            data: vec![2; 5],
        },
    ]);
    assert_eq!(image.len(), 15);
    assert!(!image.is_empty());
    assert!(FirmwareImage::new(Vec::new()).is_empty());
}

#[test]
fn contiguous_joins_segments_in_order() {
    let image = FirmwareImage::new(vec![
        FlashSegment {
            address: 0x1000,
            data: vec![1, 2],
        },
        FlashSegment {
            address: 0x0,
            data: vec![3],
        },
    ]);
    assert_eq!(&*image.contiguous(), &[1u8, 2, 3][..]);
    assert!(matches!(
        FirmwareImage::new(vec![FlashSegment {
            address: 0,
            data: vec![9; 4],
        }])
        .contiguous(),
        Cow::Borrowed(_)
    ));
}
