use std::net::{AddrParseError, IpAddr};

use itertools::izip;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{AddressFamily, Job};

/// Parallel sequences describing one run; position `i` across all three is job `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub family: AddressFamily,
    pub destinations: Vec<String>,
    pub ports: Vec<u16>,
    pub correlation_ids: Vec<String>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error(
        "destinations, ports and correlation ids differ in length \
        ({destinations}, {ports}, {correlation_ids})"
    )]
    LengthMismatch {
        destinations: usize,
        ports: usize,
        correlation_ids: usize,
    },

    #[error("invalid destination address at index {index}: `{value}`")]
    InvalidAddress {
        index: usize,
        value: String,
        source: AddrParseError,
    },

    #[error("destination {address} at index {index} is not {expected}")]
    FamilyMismatch {
        index: usize,
        address: IpAddr,
        expected: AddressFamily,
    },
}

impl RunRequest {
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            destinations: vec![],
            ports: vec![],
            correlation_ids: vec![],
        }
    }

    pub fn push(&mut self, destination: impl Into<String>, port: u16, correlation_id: impl Into<String>) {
        self.destinations.push(destination.into());
        self.ports.push(port);
        self.correlation_ids.push(correlation_id.into());
    }

    /// Number of destinations, which is only the number of jobs if [Self::into_jobs] succeeds.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    fn validate_lengths(&self) -> Result<(), RequestError> {
        let (destinations, ports, correlation_ids) = (
            self.destinations.len(),
            self.ports.len(),
            self.correlation_ids.len(),
        );
        if destinations != ports || ports != correlation_ids {
            return Err(RequestError::LengthMismatch {
                destinations,
                ports,
                correlation_ids,
            });
        }
        Ok(())
    }

    /// Zips the parallel sequences into jobs. Fails on the first structural problem,
    /// there is no partial result.
    pub fn into_jobs(self) -> Result<Vec<Job>, RequestError> {
        self.validate_lengths()?;
        let family = self.family;
        izip!(self.destinations, self.ports, self.correlation_ids)
            .enumerate()
            .map(|(index, (value, port, correlation_id))| {
                let destination: IpAddr = match value.trim().parse() {
                    Ok(addr) => addr,
                    Err(source) => {
                        return Err(RequestError::InvalidAddress { index, value, source })
                    }
                };
                if !family.matches(&destination) {
                    return Err(RequestError::FamilyMismatch {
                        index,
                        address: destination,
                        expected: family,
                    });
                }
                Ok(Job::new(destination, port, correlation_id))
            })
            .collect()
    }
}
