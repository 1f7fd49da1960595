use std::time::Duration;
use tokio::time::Instant;

/// How long a single field may take to arrive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The longest v1 header allowed, `PROXY ` and the trailing CRLF included.
pub const V1_MAX_LENGTH: usize = 107;

/// Tunables for [crate::read_header_with_config].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// Deadline for each field or segment, armed right before it is read.
    pub read_timeout: Duration,

    /// Upper bound on the length of a v1 header.
    pub max_v1_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_v1_length: V1_MAX_LENGTH,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[must_use]
    pub fn with_max_v1_length(mut self, max_v1_length: usize) -> Self {
        self.max_v1_length = max_v1_length;
        self
    }

    /// The deadline for a field read from now on. `None` if it lies beyond
    /// what [Instant] can represent, in which case reads wait forever.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        Instant::now().checked_add(self.read_timeout)
    }
}
