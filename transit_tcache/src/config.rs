//! Translation table configuration.
//!
//! All parameters are read once when the table is created. Defaults suit
//! a typical instrumentation tool; tests shrink them to exercise sector
//! rotation with a handful of translations.

use thiserror::Error;

use crate::host::PAGE_SIZE;
use crate::types::SlotNo;

/// Fewest sectors a table may have.
pub const MIN_SECTORS: usize = 2;
/// Most sectors a table may have.
pub const MAX_SECTORS: usize = 24;

/// Largest single translation accepted, in bytes.
pub const MAX_CODE_LEN: usize = 64 * 1024;

/// When the table verifies its own invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SanityLevel {
    /// Only when asked explicitly.
    Never = 0,
    /// After every sector recycle.
    OnRecycle = 1,
    /// After every mutation. Very slow.
    Always = 2,
}

/// Configuration for the translation table.
///
/// # Example
///
/// ```
/// use transit_tcache::TcacheConfig;
///
/// let config = TcacheConfig {
///     sectors: 4,
///     slots_per_sector: 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TcacheConfig {
    /// Number of sectors.
    ///
    /// Default: 8
    pub sectors: usize,

    /// Expected average translation size in bytes. Only used to size each
    /// sector's code arena.
    ///
    /// Default: 400
    pub avg_translation_size: usize,

    /// Slot table size per sector.
    ///
    /// Default: 32768
    pub slots_per_sector: usize,

    /// Percentage of a sector's slots that may be live before the sector
    /// counts as full. Keeps the lookup table's load factor bounded.
    ///
    /// Default: 80
    pub slot_fill_percent: u8,

    /// log2 of the number of fast cache entries.
    ///
    /// Default: 15
    pub fast_cache_bits: u32,

    /// Give each translation a profile counter.
    ///
    /// Default: false
    pub profiling: bool,

    /// Self-check frequency.
    ///
    /// Default: `SanityLevel::Never`
    pub sanity_level: SanityLevel,
}

impl Default for TcacheConfig {
    fn default() -> Self {
        Self {
            sectors: 8,
            avg_translation_size: 400,
            slots_per_sector: 32768,
            slot_fill_percent: 80,
            fast_cache_bits: 15,
            profiling: false,
            sanity_level: SanityLevel::Never,
        }
    }
}

impl TcacheConfig {
    /// Create a small configuration for tests and short-lived tools.
    pub fn small() -> Self {
        Self {
            sectors: MIN_SECTORS,
            avg_translation_size: 64,
            slots_per_sector: 64,
            fast_cache_bits: 8,
            ..Default::default()
        }
    }

    /// Resolve configuration from `TRANSIT_TT_*` environment variables.
    ///
    /// Unset variables keep their default values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TRANSIT_TT_SECTORS") {
            config.sectors = parse_var("TRANSIT_TT_SECTORS", &v)?;
        }
        if let Some(v) = lookup("TRANSIT_TT_AVG_SIZE") {
            config.avg_translation_size = parse_var("TRANSIT_TT_AVG_SIZE", &v)?;
        }
        if let Some(v) = lookup("TRANSIT_TT_SLOTS") {
            config.slots_per_sector = parse_var("TRANSIT_TT_SLOTS", &v)?;
        }
        if let Some(v) = lookup("TRANSIT_TT_PROFILE") {
            config.profiling = !v.is_empty() && v != "0";
        }
        if let Some(v) = lookup("TRANSIT_TT_SANITY") {
            config.sanity_level = match parse_var::<u8>("TRANSIT_TT_SANITY", &v)? {
                0 => SanityLevel::Never,
                1 => SanityLevel::OnRecycle,
                _ => SanityLevel::Always,
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SECTORS..=MAX_SECTORS).contains(&self.sectors) {
            return Err(ConfigError::SectorCount(self.sectors));
        }
        if !(16..=65536).contains(&self.avg_translation_size) {
            return Err(ConfigError::AverageSize(self.avg_translation_size));
        }
        if !(2..=SlotNo::MAX_SLOTS).contains(&self.slots_per_sector) {
            return Err(ConfigError::SlotCount(self.slots_per_sector));
        }
        if !(10..=100).contains(&self.slot_fill_percent) {
            return Err(ConfigError::FillPercent(self.slot_fill_percent));
        }
        if !(4..=20).contains(&self.fast_cache_bits) {
            return Err(ConfigError::FastCacheBits(self.fast_cache_bits));
        }
        Ok(())
    }

    /// Bytes of code arena per sector, rounded up to whole pages.
    #[inline]
    pub fn arena_bytes(&self) -> usize {
        let raw = self.slots_per_sector * self.avg_translation_size;
        raw.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// Live slots a sector may hold before it counts as full.
    #[inline]
    pub fn usable_slots(&self) -> usize {
        (self.slots_per_sector * self.slot_fill_percent as usize / 100).max(1)
    }

    /// Largest translation accepted by `add_translation`.
    #[inline]
    pub fn max_code_len(&self) -> usize {
        self.arena_bytes().min(MAX_CODE_LEN)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Malformed {
        var,
        value: value.to_string(),
    })
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Sector count outside `MIN_SECTORS..=MAX_SECTORS`.
    #[error("sector count {0} outside 2..=24")]
    SectorCount(usize),
    /// Average translation size outside 16..=65536.
    #[error("average translation size {0} outside 16..=65536")]
    AverageSize(usize),
    /// Slots per sector outside 2..=65534.
    #[error("slots per sector {0} outside 2..=65534")]
    SlotCount(usize),
    /// Fill percentage outside 10..=100.
    #[error("slot fill percentage {0} outside 10..=100")]
    FillPercent(u8),
    /// Fast cache size outside 2^4..=2^20.
    #[error("fast cache bits {0} outside 4..=20")]
    FastCacheBits(u32),
    /// An environment variable did not parse.
    #[error("cannot parse {var}={value:?}")]
    Malformed {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        assert!(TcacheConfig::default().validate().is_ok());
        assert!(TcacheConfig::small().validate().is_ok());
    }

    #[test]
    fn test_sector_bounds() {
        let config = TcacheConfig {
            sectors: 1,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SectorCount(1)));

        let config = TcacheConfig {
            sectors: MAX_SECTORS + 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SectorCount(MAX_SECTORS + 1))
        );
    }

    #[test]
    fn test_slot_count_respects_reserved_markers() {
        let config = TcacheConfig {
            slots_per_sector: 0xFFFF,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SlotCount(0xFFFF)));
    }

    #[test]
    fn test_arena_bytes_page_rounded() {
        let config = TcacheConfig {
            slots_per_sector: 10,
            avg_translation_size: 100,
            ..Default::default()
        };
        assert_eq!(config.arena_bytes(), PAGE_SIZE);
        assert_eq!(config.max_code_len(), PAGE_SIZE);
    }

    #[test]
    fn test_usable_slots() {
        let config = TcacheConfig {
            slots_per_sector: 100,
            slot_fill_percent: 50,
            ..Default::default()
        };
        assert_eq!(config.usable_slots(), 50);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = TcacheConfig::from_lookup(lookup_from(&[
            ("TRANSIT_TT_SECTORS", "4"),
            ("TRANSIT_TT_AVG_SIZE", "256"),
            ("TRANSIT_TT_PROFILE", "1"),
            ("TRANSIT_TT_SANITY", "2"),
        ]))
        .expect("valid config");
        assert_eq!(config.sectors, 4);
        assert_eq!(config.avg_translation_size, 256);
        assert!(config.profiling);
        assert_eq!(config.sanity_level, SanityLevel::Always);
        assert_eq!(config.slots_per_sector, 32768);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = TcacheConfig::from_lookup(lookup_from(&[("TRANSIT_TT_SECTORS", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Malformed {
                var: "TRANSIT_TT_SECTORS",
                ..
            }
        ));
    }

    #[test]
    fn test_from_lookup_validates() {
        let err =
            TcacheConfig::from_lookup(lookup_from(&[("TRANSIT_TT_SECTORS", "99")])).unwrap_err();
        assert_eq!(err, ConfigError::SectorCount(99));
    }
}
