use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which measurement capability a job belongs to. A run only ever contains jobs of a
/// single family, since the local source address & capture filter depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum AddressFamily {
    #[serde(rename = "ip4")]
    #[strum(serialize = "ip4")]
    V4,
    #[serde(rename = "ip6")]
    #[strum(serialize = "ip6")]
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }
}

/// One destination to probe. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub destination: IpAddr,
    pub port: u16,
    /// Opaque to the engine, only passed through to the result.
    pub correlation_id: String,
}

impl Job {
    pub fn new(destination: IpAddr, port: u16, correlation_id: impl Into<String>) -> Self {
        Self {
            destination,
            port,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.destination, self.port)
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.destination)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assertor::*;

    use super::*;

    #[test]
    fn family_labels_match_column_suffixes() {
        assert_that!(AddressFamily::V4.to_string()).is_equal_to("ip4".to_string());
        assert_that!(AddressFamily::V6.to_string()).is_equal_to("ip6".to_string());
        assert_that!(AddressFamily::from_str("ip6")).is_equal_to(Ok(AddressFamily::V6));
    }

    #[test]
    fn job_family_follows_destination() {
        // given
        let job = Job::new("2001:db8::1".parse().unwrap(), 443, "x");
        // when, then
        assert_that!(job.family()).is_equal_to(AddressFamily::V6);
        assert_that!(job.target().port()).is_equal_to(443);
    }
}
