//! Runtime configuration from environment variables.
//!
//! The host job-launch environment tunes the allocator through integer
//! environment variables, read once at init. Bad values are a hard error:
//! a misconfigured allocator must not come up half-way.
//!
//! | Variable             | Default | Meaning                                   |
//! |----------------------|---------|-------------------------------------------|
//! | `MERGE_METRIC`       | 1       | 0 off, 1 alloc-frequency, 2 threshold, 3 buffered |
//! | `MIN_MEM_TH`         | 10      | threshold watermark, decimal megabytes    |
//! | `MALLOC_MERGE_FREQ`  | 1000    | allocations per merge epoch (metric 1)    |
//! | `ENABLE_BACKTRACE`   | 0       | capture allocation-site call stacks       |
//! | `PROFILE_MODE`       | 0       | 0 none, 1 write a merge-event profile     |
//! | `NOT_MPI_APP`        | 0       | 1 enables lazy init on first allocation   |
//! | `SEM_KEY`            | 1234    | suffix of the named-semaphore path        |

use crate::error::{Error, Result};

/// Default allocation-count frequency for [`MergePolicy::AllocFrequency`].
pub const DEFAULT_MERGE_FREQ: u64 = 1000;

/// Default threshold watermark in megabytes for [`MergePolicy::Threshold`].
pub const DEFAULT_MIN_MEM_MB: u64 = 10;

/// Default suffix for the named semaphore path.
pub const DEFAULT_SEM_KEY: u32 = 1234;

/// Capacity of the dirty-page ring used by [`MergePolicy::Buffered`].
pub const DIRTY_RING_CAPACITY: usize = 10_000;

/// Upper bound accepted for `MIN_MEM_TH`, in megabytes.
const MAX_MIN_MEM_MB: u64 = 100_000;

/// When the merge engine runs.
///
/// Exactly one policy is active for the life of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Never merge; the allocator is a page-aligned anonymous allocator
    /// with bookkeeping.
    Disabled,
    /// Run a merge epoch every `merge_frequency` allocations.
    AllocFrequency,
    /// Run a merge epoch from the fault path once the combined
    /// private+shared page count passes a rising watermark.
    Threshold,
    /// Record dirty pages in a fixed ring; merge them one by one when the
    /// ring fills. Experimental.
    Buffered,
}

impl MergePolicy {
    fn from_env_value(v: u64) -> Result<Self> {
        match v {
            0 => Ok(MergePolicy::Disabled),
            1 => Ok(MergePolicy::AllocFrequency),
            2 => Ok(MergePolicy::Threshold),
            3 => Ok(MergePolicy::Buffered),
            other => Err(Error::Config(format!(
                "MERGE_METRIC must be 0..=3, got {other}"
            ))),
        }
    }
}

/// Merge-profile output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    /// No profile output.
    None,
    /// Write one `profile.<rank>` event file per process.
    Create,
}

/// Validated allocator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Active merge policy.
    pub merge_policy: MergePolicy,
    /// Threshold watermark in megabytes (before page conversion).
    pub min_mem_mb: u64,
    /// Allocation-count frequency for [`MergePolicy::AllocFrequency`].
    pub merge_frequency: u64,
    /// Capture allocation-site call stacks for attribution.
    pub enable_backtrace: bool,
    /// Merge-profile output mode.
    pub profile_mode: ProfileMode,
    /// Standalone (non-launcher) application: init lazily on first use.
    pub standalone: bool,
    /// Integer suffix of the named semaphore path.
    pub sem_key: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::AllocFrequency,
            min_mem_mb: DEFAULT_MIN_MEM_MB,
            merge_frequency: DEFAULT_MERGE_FREQ,
            enable_backtrace: false,
            profile_mode: ProfileMode::None,
            standalone: false,
            sem_key: DEFAULT_SEM_KEY,
        }
    }
}

impl Config {
    /// Read and validate the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a non-integer value, an unknown policy
    /// number, a zero merge frequency, or a watermark outside
    /// `(0, 100000)` MB.
    pub fn from_env() -> Result<Self> {
        let merge_policy = MergePolicy::from_env_value(env_u64("MERGE_METRIC", 1)?)?;
        let min_mem_mb = env_u64("MIN_MEM_TH", DEFAULT_MIN_MEM_MB)?;
        let merge_frequency = env_u64("MALLOC_MERGE_FREQ", DEFAULT_MERGE_FREQ)?;
        let enable_backtrace = env_u64("ENABLE_BACKTRACE", 0)? != 0;
        let profile_mode = match env_u64("PROFILE_MODE", 0)? {
            0 => ProfileMode::None,
            1 => ProfileMode::Create,
            other => {
                return Err(Error::Config(format!(
                    "PROFILE_MODE must be 0 or 1, got {other}"
                )))
            }
        };
        let standalone = env_u64("NOT_MPI_APP", 0)? != 0;
        let sem_key = env_u64("SEM_KEY", u64::from(DEFAULT_SEM_KEY))? as u32;

        let config = Self {
            merge_policy,
            min_mem_mb,
            merge_frequency,
            enable_backtrace,
            profile_mode,
            standalone,
            sem_key,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_mem_mb == 0 || self.min_mem_mb >= MAX_MIN_MEM_MB {
            return Err(Error::Config(format!(
                "MIN_MEM_TH must be in (0, {MAX_MIN_MEM_MB}) MB, got {}",
                self.min_mem_mb
            )));
        }
        if self.merge_frequency == 0 {
            return Err(Error::Config("MALLOC_MERGE_FREQ must be > 0".into()));
        }
        Ok(())
    }

    /// Threshold watermark converted to pages.
    ///
    /// Decimal megabytes, matching the knob's documented unit.
    pub fn threshold_pages(&self, page_size: usize) -> i64 {
        (self.min_mem_mb * 1_000_000 / page_size as u64) as i64
    }

    /// Path of the named semaphore derived from `SEM_KEY`.
    pub fn sem_name(&self) -> String {
        format!("/pagefold-sem-{}", self.sem_key)
    }

    /// Name of the shared-memory backing derived from `SEM_KEY`.
    ///
    /// The backing and its semaphore must pair up: two jobs with
    /// different keys on one node get fully separate heaps.
    pub fn shm_name(&self) -> String {
        format!("{}-{}", crate::backing::SHM_NAME, self.sem_key)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(Error::Config(format!("{name} is not valid unicode")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.merge_policy, MergePolicy::AllocFrequency);
        assert_eq!(config.merge_frequency, DEFAULT_MERGE_FREQ);
        assert_eq!(config.min_mem_mb, DEFAULT_MIN_MEM_MB);
        assert_eq!(config.sem_key, DEFAULT_SEM_KEY);
        assert!(!config.enable_backtrace);
        assert!(!config.standalone);
    }

    #[test]
    fn test_policy_values() {
        assert_eq!(
            MergePolicy::from_env_value(0).unwrap(),
            MergePolicy::Disabled
        );
        assert_eq!(
            MergePolicy::from_env_value(2).unwrap(),
            MergePolicy::Threshold
        );
        assert!(MergePolicy::from_env_value(4).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_watermark() {
        let mut config = Config::default();
        config.min_mem_mb = 0;
        assert!(config.validate().is_err());
        config.min_mem_mb = MAX_MIN_MEM_MB;
        assert!(config.validate().is_err());
        config.min_mem_mb = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let mut config = Config::default();
        config.merge_frequency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_pages_uses_decimal_megabytes() {
        let config = Config::default();
        // 10 MB at 4 KiB pages: 10_000_000 / 4096 = 2441 pages.
        assert_eq!(config.threshold_pages(4096), 2441);
    }

    #[test]
    fn test_resource_names_pair_up() {
        let config = Config::default();
        assert_eq!(config.sem_name(), "/pagefold-sem-1234");
        assert_eq!(config.shm_name(), "/pagefold-heap-1234");
    }
}
