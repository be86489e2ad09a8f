//! Admission limit derivation.
//!
//! The supervisor never tracks more workers than it has descriptors for:
//! each worker costs two descriptors at admission time (the diagnostic
//! pipe's read end, kept for the worker's lifetime, and the connection
//! socket, held until the spawn returns).

use std::io;

use tracing::debug;

/// Default ceiling on concurrently running workers.
pub const DEFAULT_MAX_PROCESSES: usize = 1024;

/// Descriptors the supervisor holds regardless of workers: stdio and the listener.
const RESERVED_DESCRIPTORS: u64 = 4;

/// Descriptors consumed per admitted worker.
const DESCRIPTORS_PER_WORKER: u64 = 2;

/// Errors that can occur while deriving the admission limit.
#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("The maximum number of processes must be at least 1")]
    Zero,

    #[error("Could not query the open file limit: {0}")]
    Rlimit(#[source] io::Error),

    #[error("Open file limit {open_files} leaves no room for a single worker")]
    TooFewDescriptors { open_files: u64 },
}

/// Maximum number of concurrently tracked workers (`mproc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimit(usize);

impl AdmissionLimit {
    /// Creates a limit from an explicit value.
    pub fn new(max_processes: usize) -> Result<Self, LimitError> {
        if max_processes == 0 {
            return Err(LimitError::Zero);
        }
        Ok(Self(max_processes))
    }

    /// Derives the limit from a ceiling and an open file limit.
    pub fn from_descriptor_limit(ceiling: usize, open_files: u64) -> Result<Self, LimitError> {
        if ceiling == 0 {
            return Err(LimitError::Zero);
        }
        let by_descriptors = open_files.saturating_sub(RESERVED_DESCRIPTORS) / DESCRIPTORS_PER_WORKER;
        if by_descriptors == 0 {
            return Err(LimitError::TooFewDescriptors { open_files });
        }
        let by_descriptors = usize::try_from(by_descriptors).unwrap_or(usize::MAX);
        Ok(Self(ceiling.min(by_descriptors)))
    }

    /// Derives the limit from a ceiling and the current `RLIMIT_NOFILE`.
    pub fn detect(ceiling: usize) -> Result<Self, LimitError> {
        let open_files = open_file_limit().map_err(LimitError::Rlimit)?;
        let limit = match open_files {
            Some(open_files) => Self::from_descriptor_limit(ceiling, open_files)?,
            None => Self::new(ceiling)?,
        };
        debug!(
            ceiling,
            open_files = ?open_files,
            max_processes = limit.get(),
            "Derived admission limit"
        );
        Ok(limit)
    }

    /// Returns the limit as a worker count.
    pub fn get(self) -> usize {
        self.0
    }
}

/// Returns the soft open file limit, or `None` when unlimited.
fn open_file_limit() -> io::Result<Option<u64>> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return Ok(None);
    }
    #[allow(clippy::useless_conversion)]
    Ok(Some(u64::from(limit.rlim_cur)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_rejected() {
        assert!(matches!(AdmissionLimit::new(0), Err(LimitError::Zero)));
        assert!(matches!(
            AdmissionLimit::from_descriptor_limit(0, 1024),
            Err(LimitError::Zero)
        ));
    }

    #[test]
    fn test_ceiling_wins_when_smaller() {
        let limit = AdmissionLimit::from_descriptor_limit(10, 1024).unwrap();
        assert_eq!(limit.get(), 10);
    }

    #[test]
    fn test_descriptors_win_when_smaller() {
        // (64 - 4) / 2
        let limit = AdmissionLimit::from_descriptor_limit(1024, 64).unwrap();
        assert_eq!(limit.get(), 30);
    }

    #[test]
    fn test_too_few_descriptors() {
        assert!(matches!(
            AdmissionLimit::from_descriptor_limit(8, 5),
            Err(LimitError::TooFewDescriptors { open_files: 5 })
        ));
        assert_eq!(AdmissionLimit::from_descriptor_limit(8, 6).unwrap().get(), 1);
    }

    #[test]
    fn test_detect_respects_ceiling() {
        let limit = AdmissionLimit::detect(3).unwrap();
        assert!(limit.get() >= 1 && limit.get() <= 3);
    }
}
