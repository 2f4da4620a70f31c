use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Deserialize;
use spider_models::{AddressFamily, RunRequest, RunResult};

/// One line of the job file.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub destination_address: String,
    pub destination_port: u16,
    pub correlation_id: String,
}

/// Reads a run request from newline-delimited JSON, or from CSV with a header row.
/// The address family is that of the first record; addresses are validated later,
/// when the request is turned into jobs.
pub fn read_request(path: &Path, csv_input: bool) -> Result<RunRequest> {
    let file = File::open(path).with_context(|| format!("while opening job file {:?}", path))?;
    let records = if csv_input {
        read_csv(file)
    } else {
        read_ndjson(file)
    }
    .with_context(|| format!("while reading jobs from {:?}", path))?;

    let family = records
        .first()
        .and_then(|it| it.destination_address.parse::<IpAddr>().ok())
        .map_or(AddressFamily::V4, |it| AddressFamily::of(&it));
    let mut request = RunRequest::new(family);
    for record in records {
        request.push(record.destination_address, record.destination_port, record.correlation_id);
    }
    debug!("Read {} {} jobs from {:?}", request.len(), family, path);
    Ok(request)
}

fn read_ndjson(source: impl Read) -> Result<Vec<JobRecord>> {
    serde_json::Deserializer::from_reader(BufReader::new(source))
        .into_iter::<JobRecord>()
        .enumerate()
        .map(|(i, it)| it.with_context(|| format!("in JSON record #{}", i + 1)))
        .collect()
}

fn read_csv(source: impl Read) -> Result<Vec<JobRecord>> {
    csv::Reader::from_reader(source)
        .deserialize::<JobRecord>()
        .enumerate()
        .map(|(i, it)| it.with_context(|| format!("in CSV record #{}", i + 1)))
        .collect()
}

/// Writes one JSON object per result, with the columns of the given address family.
pub fn write_results(path: &Path, result: &RunResult, family: AddressFamily) -> Result<()> {
    let file = File::create(path).with_context(|| format!("while creating output {:?}", path))?;
    let mut writer = BufWriter::new(file);
    let rows = result
        .to_rows(family)
        .context("while encoding trace or flow details")?;
    for row in rows {
        serde_json::to_writer(&mut writer, &row).context("while encoding a result")?;
        writeln!(writer).with_context(|| format!("while writing to {:?}", path))?;
    }
    writer
        .flush()
        .with_context(|| format!("while flushing {:?}", path))?;
    info!(
        "Wrote {} results of the run from {} to {}{}",
        result.results.len(),
        result.started_at,
        result.stopped_at,
        if result.cancelled { ", which was cancelled" } else { "" }
    );
    Ok(())
}
