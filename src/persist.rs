//! Consolidated on-disk record of every rank's samples.
//!
//! Rows are gathered onto the coordinator one rank at a time and streamed
//! into a CSV file opened in append mode, so peak memory on the coordinator
//! is bounded by the largest single rank's sample set.
//!
//! Latencies are written in seconds using the shortest representation that
//! parses back to the same `f64`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::topology::{ProcessTopology, COORDINATOR};
use crate::trial::SampleBuffer;

const TAG_LATENCIES: i32 = 100;
const TAG_STARTS: i32 = 101;
const TAG_ENDS: i32 = 102;

/// Layout of the persisted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    /// `Rank,Iteration,Latency`
    #[default]
    Latency,
    /// `Rank,Iteration,Starttime,Endtime`
    StartEnd,
}

impl RecordFormat {
    /// Header row, without the line terminator.
    pub fn header(self) -> &'static str {
        match self {
            RecordFormat::Latency => "Rank,Iteration,Latency",
            RecordFormat::StartEnd => "Rank,Iteration,Starttime,Endtime",
        }
    }
}

impl std::str::FromStr for RecordFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "latency" => Ok(RecordFormat::Latency),
            "startend" | "start-end" | "timestamps" => Ok(RecordFormat::StartEnd),
            other => Err(Error::InvalidOption(format!("unknown record format '{other}'"))),
        }
    }
}

/// One row of a latency record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyRecord {
    /// Rank that measured the trial
    pub rank: usize,
    /// Trial index on that rank
    pub iteration: usize,
    /// Latency in seconds
    pub latency: f64,
}

/// One row of a start/end record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartEndRecord {
    /// Rank that measured the trial
    pub rank: usize,
    /// Trial index on that rank
    pub iteration: usize,
    /// Start timestamp in seconds
    pub start: f64,
    /// End timestamp in seconds
    pub end: f64,
}

/// Writes every rank's samples to one file on the coordinator.
pub struct LatencyPersister<'a, C: Communicator> {
    comm: &'a C,
    topology: ProcessTopology,
    path: PathBuf,
    format: RecordFormat,
}

impl<'a, C: Communicator> LatencyPersister<'a, C> {
    /// Create a persister writing to `path`.
    pub fn new(
        comm: &'a C,
        topology: ProcessTopology,
        path: impl Into<PathBuf>,
        format: RecordFormat,
    ) -> Self {
        LatencyPersister {
            comm,
            topology,
            path: path.into(),
            format,
        }
    }

    /// Destination of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Collectively persist `samples`; every rank must call this.
    ///
    /// Ranks may hold different numbers of samples. Returns the number of
    /// rows written on the coordinator and zero elsewhere.
    pub fn persist(&self, samples: &SampleBuffer) -> Result<usize> {
        if samples.is_empty() {
            return Err(Error::NoSamples);
        }
        let counts = self
            .comm
            .gather_scalar(samples.len() as u64, COORDINATOR)?;

        if !self.topology.is_coordinator() {
            match self.format {
                RecordFormat::Latency => {
                    self.comm
                        .send(&samples.latencies(), COORDINATOR, TAG_LATENCIES)?;
                }
                RecordFormat::StartEnd => {
                    self.comm.send(&samples.starts(), COORDINATOR, TAG_STARTS)?;
                    self.comm.send(&samples.ends(), COORDINATOR, TAG_ENDS)?;
                }
            }
            return Ok(0);
        }

        let (file, fresh) = self.open()?;
        let mut out = BufWriter::new(file);
        let werr = |e| Error::io(&self.path, e);
        if fresh {
            writeln!(out, "{}", self.format.header()).map_err(werr)?;
        }

        let mut rows = self.write_block(&mut out, 0, samples.starts(), samples.ends())?;
        for (rank, &count) in counts.iter().enumerate().skip(1) {
            let expected = usize::try_from(count).map_err(|_| Error::InvalidCount(count as i64))?;
            let block = self.receive_block(rank, expected)?;
            rows += match block {
                Block::Latencies(latencies) => {
                    write_latencies(&mut out, rank, &latencies).map_err(werr)?
                }
                Block::StartEnd(starts, ends) => self.write_block(&mut out, rank, starts, ends)?,
            };
            debug!(rank, rows = expected, "persisted block");
        }
        out.flush().map_err(werr)?;
        info!(path = %self.path.display(), rows, "results written");
        Ok(rows)
    }

    /// Open for appending; `true` if the file was empty.
    fn open(&self) -> Result<(File, bool)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io(&self.path, e))?
            .len();
        Ok((file, len == 0))
    }

    fn receive_block(&self, rank: usize, expected: usize) -> Result<Block> {
        let source = rank as i32;
        match self.format {
            RecordFormat::Latency => {
                let mut latencies = vec![0.0f64; expected];
                let status = self.comm.recv(&mut latencies, source, TAG_LATENCIES)?;
                if status.count != expected as i64 {
                    return Err(Error::CountMismatch {
                        rank,
                        found: status.count as u64,
                        expected: expected as u64,
                    });
                }
                Ok(Block::Latencies(latencies))
            }
            RecordFormat::StartEnd => {
                let mut starts = vec![0.0f64; expected];
                let mut ends = vec![0.0f64; expected];
                let s = self.comm.recv(&mut starts, source, TAG_STARTS)?;
                let e = self.comm.recv(&mut ends, source, TAG_ENDS)?;
                if s.count != e.count || s.count != expected as i64 {
                    return Err(Error::SampleMismatch {
                        rank,
                        starts: s.count as u64,
                        ends: e.count as u64,
                    });
                }
                Ok(Block::StartEnd(starts, ends))
            }
        }
    }

    fn write_block<W: Write>(
        &self,
        out: &mut W,
        rank: usize,
        starts: Vec<f64>,
        ends: Vec<f64>,
    ) -> Result<usize> {
        if starts.len() != ends.len() {
            return Err(Error::SampleMismatch {
                rank,
                starts: starts.len() as u64,
                ends: ends.len() as u64,
            });
        }
        let werr = |e| Error::io(&self.path, e);
        match self.format {
            RecordFormat::Latency => {
                let latencies: Vec<f64> = starts.iter().zip(&ends).map(|(s, e)| e - s).collect();
                write_latencies(out, rank, &latencies).map_err(werr)
            }
            RecordFormat::StartEnd => {
                for (i, (s, e)) in starts.iter().zip(&ends).enumerate() {
                    writeln!(out, "{rank},{i},{s},{e}").map_err(werr)?;
                }
                Ok(starts.len())
            }
        }
    }
}

enum Block {
    Latencies(Vec<f64>),
    StartEnd(Vec<f64>, Vec<f64>),
}

fn write_latencies<W: Write>(out: &mut W, rank: usize, latencies: &[f64]) -> std::io::Result<usize> {
    for (i, latency) in latencies.iter().enumerate() {
        writeln!(out, "{rank},{i},{latency}")?;
    }
    Ok(latencies.len())
}

/// Read back a record written in [`RecordFormat::Latency`].
///
/// Header rows are skipped wherever they appear.
pub fn read_latency_records(path: impl AsRef<Path>) -> Result<Vec<LatencyRecord>> {
    read_rows(path.as_ref(), RecordFormat::Latency, |fields| {
        Some(LatencyRecord {
            rank: fields.first()?.parse().ok()?,
            iteration: fields.get(1)?.parse().ok()?,
            latency: fields.get(2)?.parse().ok()?,
        })
    })
}

/// Read back a record written in [`RecordFormat::StartEnd`].
pub fn read_start_end_records(path: impl AsRef<Path>) -> Result<Vec<StartEndRecord>> {
    read_rows(path.as_ref(), RecordFormat::StartEnd, |fields| {
        Some(StartEndRecord {
            rank: fields.first()?.parse().ok()?,
            iteration: fields.get(1)?.parse().ok()?,
            start: fields.get(2)?.parse().ok()?,
            end: fields.get(3)?.parse().ok()?,
        })
    })
}

fn read_rows<R>(
    path: &Path,
    format: RecordFormat,
    parse: impl Fn(&[&str]) -> Option<R>,
) -> Result<Vec<R>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let line = line.trim();
        if line.is_empty() || line == format.header() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let record = parse(&fields)
            .ok_or_else(|| Error::config(path, format!("malformed record on line {}", lineno + 1)))?;
        records.push(record);
    }
    Ok(records)
}
