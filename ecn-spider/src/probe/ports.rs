use crate::error::EngineError;

/// A worker's own share of the source port range, handed out round-robin. Slices of
/// different workers never overlap, so flows of concurrent jobs can't collide.
#[derive(Debug, Clone)]
pub struct PortSlice {
    first: u16,
    len: u16,
    next: u16,
}

/// Every flow of a job needs its own port.
pub const PORTS_PER_JOB: u16 = 2;

impl PortSlice {
    pub fn next_port(&mut self) -> u16 {
        let port = self.first + self.next;
        self.next = (self.next + 1) % self.len;
        port
    }

    pub fn len(&self) -> u16 {
        self.len
    }
}

/// Splits `min..=max` evenly, the remainder goes unused.
pub fn split(min: u16, max: u16, workers: usize) -> Result<Vec<PortSlice>, EngineError> {
    let exhausted = || EngineError::PortsExhausted { min, max, workers };
    if workers == 0 || max < min {
        return Err(exhausted());
    }
    let total = (max - min) as usize + 1;
    let per_worker = total / workers;
    if per_worker < PORTS_PER_JOB as usize {
        return Err(exhausted());
    }
    let len = per_worker.min(u16::MAX as usize) as u16;
    Ok((0..workers)
        .map(|i| PortSlice {
            first: min + (i * per_worker) as u16,
            len,
            next: 0,
        })
        .collect())
}
