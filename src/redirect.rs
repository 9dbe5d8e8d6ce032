/// How many `301`/`302`/`303`/`307`/`308` hops a request may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const DEFAULT_MAX_REDIRECTS: usize = 10;

    /// Redirect responses are returned to the caller as they are.
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(Self::DEFAULT_MAX_REDIRECTS)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::follow()
    }
}
