use std::fmt;

use crate::consts::{BLOCK_SIZE, INT_SIZE};
use crate::error::{PmemError, Result};

/// Requested configuration of an append-only log.
///
/// The padding and ordering stored in an existing log header win over these
/// values until the log is cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Pad records to 256-byte media blocks instead of 4-byte ints.
    pub block_padding: bool,
    /// Strict ordering: each record is fully flushed under the writer lock,
    /// and scans stop at the first bad record.
    pub linear_ordering: bool,
    /// Store the tail into the checkpoint field after every append.
    pub always_checkpoint: bool,
    /// Recovery trusts the checkpoint as the tail; iterators stop there.
    pub authoritative_checkpoint_on_reads: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            block_padding: false,
            linear_ordering: true,
            always_checkpoint: false,
            authoritative_checkpoint_on_reads: false,
        }
    }
}

impl LogConfig {
    pub fn new(block_padding: bool, linear_ordering: bool) -> Self {
        Self {
            block_padding,
            linear_ordering,
            ..Self::default()
        }
    }

    pub fn with_always_checkpoint(mut self, on: bool) -> Self {
        self.always_checkpoint = on;
        self
    }

    pub fn with_authoritative_checkpoint_on_reads(mut self, on: bool) -> Self {
        self.authoritative_checkpoint_on_reads = on;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.always_checkpoint && !self.linear_ordering {
            return Err(PmemError::invalid_arg(
                "linear_ordering must be true when always_checkpoint is enabled",
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn padding_size(&self) -> usize {
        if self.block_padding {
            BLOCK_SIZE
        } else {
            INT_SIZE
        }
    }
}

impl fmt::Display for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogConfig{{block_padding={}, linear_ordering={}, always_checkpoint={}, authoritative_checkpoint_on_reads={}}}",
            self.block_padding,
            self.linear_ordering,
            self.always_checkpoint,
            self.authoritative_checkpoint_on_reads
        )
    }
}

/// Bytes needed to pad `len` up to a multiple of `p`.
#[inline]
pub fn align_pad(len: usize, p: usize) -> usize {
    if p == 0 {
        0
    } else {
        (p - len % p) % p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_checkpoint_requires_linear() {
        let bad = LogConfig::new(false, false).with_always_checkpoint(true);
        assert!(matches!(bad.validate(), Err(PmemError::InvalidArgument(_))));
        let ok = LogConfig::new(true, true).with_always_checkpoint(true);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.padding_size(), 256);
    }

    #[test]
    fn pad_math() {
        assert_eq!(align_pad(1, 4), 3);
        assert_eq!(align_pad(4, 4), 0);
        assert_eq!(align_pad(250, 256), 6);
        assert_eq!(align_pad(7, 0), 0);
    }
}
