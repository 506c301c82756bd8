use crate::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PADDING: i64 = 2;
pub const DEFAULT_DECAY_INTERVAL: i64 = 5;

/// Sizing knobs of a [`ReadAheadBuffer`](crate::ReadAheadBuffer).
///
/// Values are kept signed so configuration coming from outside (files, flags) can be rejected
/// with a proper error instead of wrapping around.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Extra producer invocations kept in flight above the observed consumer peak.
    pub padding: i64,
    /// Number of satisfied requests after which the consumer peak is lowered by one.
    pub decay_interval: i64,
}

/// Validated form of [`BufferConfig`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct Sizing {
    pub padding: usize,
    pub decay_interval: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            padding: DEFAULT_PADDING,
            decay_interval: DEFAULT_DECAY_INTERVAL,
        }
    }
}

impl BufferConfig {
    pub const fn new(padding: i64, decay_interval: i64) -> Self {
        Self { padding, decay_interval }
    }

    pub fn validate(&self) -> Result<()> {
        self.sizing().map(|_| ())
    }

    pub(crate) fn sizing(&self) -> Result<Sizing> {
        let padding = usize::try_from(self.padding).map_err(|_| Error::invalid("padding", "a non-negative number was expected"))?;
        let decay_interval =
            usize::try_from(self.decay_interval).map_err(|_| Error::invalid("decay_interval", "a non-negative number was expected"))?;
        Ok(Sizing { padding, decay_interval })
    }
}
