use std::sync::Arc;

use crate::error::Result;
use crate::labels::Labels;

/// One scraped payload. The body is the raw response of a scrape, opaque to
/// the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RawSample {
    pub raw_metrics: Vec<u8>,
}

/// Sample sink. Implementations must tolerate concurrent appends from
/// arbitrarily many scrape loops.
pub trait Appender: Send + Sync {
    fn append(&self, labels: &Labels, sample: RawSample) -> Result<()>;
}

pub trait Appendable: Send + Sync {
    /// Hands out an appender for one scrape loop.
    fn appender(&self) -> Arc<dyn Appender>;
}
