use std::fmt::{Display, Formatter};
use std::str::FromStr;

use itertools::Itertools;

/// Conventional initial TTLs that end hosts start counting down from. A TTL observed
/// at our end was most likely sent with the smallest band not below it, and every hop
/// on the way took one off. With the default bands, a TTL of 64 is one hop away (the
/// sender started at 64), 63 is two hops away and 65 starts over at 128.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlBands {
    initial: Vec<u8>,
}

impl TtlBands {
    pub fn new(initial: impl IntoIterator<Item = u8>) -> Self {
        let initial = initial.into_iter().sorted().dedup().collect();
        Self { initial }
    }

    /// Hops between the sender and us, `None` if the TTL lies above every band.
    pub fn hops(&self, observed_ttl: u8) -> Option<u8> {
        let initial = self.initial.iter().find(|it| **it >= observed_ttl)?;
        (initial - observed_ttl).checked_add(1)
    }
}

impl Default for TtlBands {
    fn default() -> Self {
        Self::new([32, 64, 128, 255])
    }
}

impl FromStr for TtlBands {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: Vec<u8> = s
            .split(',')
            .map(|it| it.trim().parse::<u8>())
            .try_collect()
            .map_err(|e| format!("TTL bands must be comma-separated numbers up to 255: {}", e))?;
        if parsed.is_empty() || parsed.contains(&0) {
            return Err("TTL bands must be non-empty and positive".to_string());
        }
        Ok(Self::new(parsed))
    }
}

impl Display for TtlBands {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.initial.iter().join(","))
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn band_boundaries() {
        let bands = TtlBands::default();
        assert_that!(bands.hops(64)).has_value(1);
        assert_that!(bands.hops(63)).has_value(2);
        assert_that!(bands.hops(128)).has_value(1);
        assert_that!(bands.hops(32)).has_value(1);
        assert_that!(bands.hops(31)).has_value(2);
        assert_that!(bands.hops(65)).has_value(64);
        assert_that!(bands.hops(255)).has_value(1);
        assert_that!(bands.hops(250)).has_value(6);
    }

    #[test]
    fn above_largest_band_is_unknown() {
        // given
        let bands: TtlBands = "64,128".parse().unwrap();
        // when, then
        assert_that!(bands.hops(129)).is_none();
        assert_that!(bands.hops(100)).has_value(29);
    }

    #[test]
    fn parse_sorts_and_dedups() {
        // given
        let bands: TtlBands = " 128,64 ,64".parse().unwrap();
        // then
        assert_that!(bands.to_string()).is_equal_to("64,128".to_string());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_that!("64,abc".parse::<TtlBands>()).is_err();
        assert_that!("0,64".parse::<TtlBands>()).is_err();
        assert_that!("256".parse::<TtlBands>()).is_err();
    }
}
