//! Byte-level progress of a download or a transfer.

/// Progress snapshot, recomputed at every chunk boundary.
///
/// `total` and `percent` are `None` when the size is not known in advance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
}
impl TransferProgress {
    /// Download progress: percent is rounded to the nearest integer.
    pub fn download(loaded: u64, total: Option<u64>) -> Self {
        let percent = total.map(|total| {
            if total == 0 {
                100
            } else {
                ((loaded.min(total) * 200 + total) / (2 * total)) as u8
            }
        });
        TransferProgress {
            loaded,
            total,
            percent,
        }
    }

    /// Transfer progress: percent is truncated so that 100 is only reported
    /// once every byte has been written.
    pub fn transfer(loaded: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (loaded.min(total) * 100 / total) as u8
        };
        TransferProgress {
            loaded,
            total: Some(total),
            percent: Some(percent),
        }
    }

    /// A finished transfer of `total` bytes.
    pub fn complete(total: u64) -> Self {
        TransferProgress {
            loaded: total,
            total: Some(total),
            percent: Some(100),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.percent.is_none()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn download_rounds_to_nearest() {
    assert_eq!(TransferProgress::download(16384, Some(40000)).percent, Some(41));
    assert_eq!(TransferProgress::download(200, Some(1000)).percent, Some(20));
    assert_eq!(TransferProgress::download(5, Some(1000)).percent, Some(1));
    assert_eq!(TransferProgress::download(4, Some(1000)).percent, Some(0));
}

#[test]
fn download_without_length_is_indeterminate() {
    let progress = TransferProgress::download(1234, None);
    assert!(progress.is_indeterminate());
    assert_eq!(progress.loaded, 1234);
}

#[test]
fn transfer_truncates() {
    let percents: Vec<u8> = [16384u64, 32768, 40000]
        .iter()
        .map(|loaded| TransferProgress::transfer(*loaded, 40000).percent.unwrap())
        .collect();
    assert_eq!(percents, vec![40, 81, 100]);
}

#[test]
fn empty_transfer_is_complete() {
    assert_eq!(TransferProgress::transfer(0, 0).percent, Some(100));
    assert_eq!(TransferProgress::download(0, Some(0)).percent, Some(100));
}
