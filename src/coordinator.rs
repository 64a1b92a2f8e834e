//! One scan pass over one input path, across the whole peer group.
//!
//! The coordinator (peer 0) seeds the work queue, slices it among the peers
//! with the configured splitter, and ships each slice as two tagged messages:
//! the serialized byte length (zero meaning "no work"), then the payload.
//! Every peer completes whatever landed locally, the usage trees reduce to
//! the coordinator, and the coordinator presents.
//!
//! Each input path is processed independently: a transport failure abandons
//! the current path and the caller moves on to the next one.

use std::io::{self, Write};

use byte_stream::{ByteStream, Options};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::comm::{self, tag, CommError, Transport};
use crate::path::ScanPath;
use crate::queue::{QueueError, SeedPolicy, WorkQueue};
use crate::usage::{NameFn, SummarizeOptions, TreeOrder};

/// How the coordinator assigns seed paths to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Splitter {
    #[default]
    Contiguous,
    Strided,
    Randomized,
}

impl Splitter {
    pub fn parse(name: &str) -> Option<Splitter> {
        match name {
            "default" | "contiguous" => Some(Splitter::Contiguous),
            "strided" => Some(Splitter::Strided),
            "randomized" => Some(Splitter::Randomized),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Splitter::Contiguous => "contiguous",
            Splitter::Strided => "strided",
            Splitter::Randomized => "randomized",
        }
    }
}

// Shuffle passes applied before a randomized contiguous split.
const RANDOMIZE_PASSES: u32 = 3;

#[derive(Debug, Snafu)]
pub enum ScanError {
    #[snafu(display("transport failure: {source}"))]
    Transport { source: CommError },

    #[snafu(display("work queue serialization failed: {source}"))]
    Serialize { source: QueueError },

    #[snafu(display("work queue deserialization failed: {source}"))]
    Deserialize { source: QueueError },

    #[snafu(display("peer 0 announced {expected} payload byte(s) but sent {actual}"))]
    LengthMismatch { expected: u64, actual: usize },

    #[snafu(display("unable to write summary: {source}"))]
    Present { source: io::Error },
}

/// Per-run settings shared by every peer (each parses the same argv).
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub parameter: crate::usage::Parameter,
    /// `None` selects the mode default: depth 1 solo, path-count = group
    /// size otherwise.
    pub seed_policy: Option<SeedPolicy>,
    pub splitter: Splitter,
    pub sort: bool,
    pub human_readable: bool,
    pub show_queue_summary: bool,
}

/// Scan `root` and, on peer 0, write the per-user and per-group summaries to
/// `out`. Returns whether the traversal was clean (no skipped entries).
pub fn scan_path<T: Transport, W: Write>(
    group: &mut T,
    config: &ScanConfig,
    root: &ScanPath,
    out: &mut W,
    uid_names: Option<NameFn<'_>>,
    gid_names: Option<NameFn<'_>>,
) -> Result<bool, ScanError> {
    let size = group.size();
    let rank = group.rank();
    let mut clean = true;

    let mut queue = WorkQueue::new(config.parameter);
    if rank == 0 {
        let policy = config.seed_policy.unwrap_or(if size == 1 {
            SeedPolicy::ByPathDepth(1)
        } else {
            SeedPolicy::ByPathCount(size)
        });
        info!(root = %root, ?policy, "seeding work queue");
        clean &= queue.build(root, policy);
        queue.summary();
        if size > 1 {
            split_and_ship(group, &mut queue, config.splitter)?;
        }
    } else {
        queue = receive_queue(group, config)?;
    }

    if config.show_queue_summary {
        println!("[{rank}] {}", queue.to_csv());
    }

    debug!(paths = queue.len(), "completing local traversal");
    clean &= queue.complete();

    if size > 1 {
        group.barrier().context(TransportSnafu)?;
        queue.by_uid_mut().reduce(group, 0).context(TransportSnafu)?;
        queue.by_gid_mut().reduce(group, 0).context(TransportSnafu)?;
    }

    if rank == 0 {
        present(&mut queue, config, root, out, uid_names, gid_names)
            .context(PresentSnafu)?;
    }
    Ok(clean)
}

/// Paths peer `peer` receives under a contiguous split of `total` paths
/// among `size` peers. The coordinator keeps the left-over share.
fn contiguous_share(total: usize, size: usize, peer: usize) -> usize {
    total / size + usize::from(peer < total % size)
}

fn split_and_ship<T: Transport>(
    group: &mut T,
    queue: &mut WorkQueue,
    splitter: Splitter,
) -> Result<(), ScanError> {
    match splitter {
        Splitter::Randomized => {
            queue.randomize(RANDOMIZE_PASSES);
            contiguous_split(group, queue)
        }
        Splitter::Contiguous => contiguous_split(group, queue),
        Splitter::Strided => strided_split(group, queue),
    }
}

fn contiguous_split<T: Transport>(
    group: &mut T,
    queue: &mut WorkQueue,
) -> Result<(), ScanError> {
    let size = group.size();
    let total = queue.len();
    for peer in 1..size {
        let share = contiguous_share(total, size, peer);
        if share == 0 {
            ship_queue(group, peer, None)?;
            continue;
        }
        let stream = queue.serialize_range(0, share).context(SerializeSnafu)?;
        ship_queue(group, peer, Some(stream.as_slice()))?;
        queue.delete(0, share);
    }
    debug!(retained = queue.len(), "contiguous split complete");
    Ok(())
}

fn strided_split<T: Transport>(group: &mut T, queue: &mut WorkQueue) -> Result<(), ScanError> {
    let size = group.size();
    for peer in 1..size {
        let stride = size - peer + 1;
        let (stream, count) = queue.serialize_strided(0, stride).context(SerializeSnafu)?;
        if count == 0 {
            ship_queue(group, peer, None)?;
            continue;
        }
        ship_queue(group, peer, Some(stream.as_slice()))?;
        queue.retain(|index, _| index % stride != 0);
    }
    debug!(retained = queue.len(), "strided split complete");
    Ok(())
}

// Two messages per peer: the payload length (zero = no work), then the
// payload itself if there is one.
fn ship_queue<T: Transport>(
    group: &mut T,
    peer: usize,
    payload: Option<&[u8]>,
) -> Result<(), ScanError> {
    let length = payload.map_or(0, <[u8]>::len) as u64;
    let mut header = ByteStream::with_capacity(8, Options::LITTLE_ENDIAN);
    header
        .append_u64(length)
        .unwrap_or_else(|_| unreachable!("owned streams accept appends"));
    group
        .send(peer, tag::QUEUE_LEN, header.as_slice())
        .context(TransportSnafu)?;
    if let Some(payload) = payload {
        group
            .send(peer, tag::QUEUE_PAYLOAD, payload)
            .context(TransportSnafu)?;
    }
    debug!(peer, length, "shipped work queue slice");
    Ok(())
}

fn receive_queue<T: Transport>(
    group: &mut T,
    config: &ScanConfig,
) -> Result<WorkQueue, ScanError> {
    let header = group.recv(0, tag::QUEUE_LEN).context(TransportSnafu)?;
    let length = ByteStream::from_bytes(header.into(), Options::LITTLE_ENDIAN)
        .decoder()
        .u64()
        .context(comm::DecodeSnafu { peer: 0usize })
        .context(TransportSnafu)?;
    if length == 0 {
        debug!("no work assigned");
        return Ok(WorkQueue::new(config.parameter));
    }

    let payload = group.recv(0, tag::QUEUE_PAYLOAD).context(TransportSnafu)?;
    if payload.len() as u64 != length {
        return Err(ScanError::LengthMismatch {
            expected: length,
            actual: payload.len(),
        });
    }
    let stream = ByteStream::from_bytes(payload.into(), Options::LITTLE_ENDIAN);
    let queue = WorkQueue::deserialize(&stream).context(DeserializeSnafu)?;
    debug!(paths = queue.len(), "received work queue slice");
    Ok(queue)
}

fn present<W: Write>(
    queue: &mut WorkQueue,
    config: &ScanConfig,
    root: &ScanPath,
    out: &mut W,
    uid_names: Option<NameFn<'_>>,
    gid_names: Option<NameFn<'_>>,
) -> io::Result<()> {
    let order = if config.sort {
        queue.by_uid_mut().sort();
        queue.by_gid_mut().sort();
        TreeOrder::ByBytes
    } else {
        TreeOrder::Native
    };
    queue.by_uid_mut().calculate_totals();
    queue.by_gid_mut().calculate_totals();

    let options = SummarizeOptions {
        human_readable: config.human_readable,
    };
    writeln!(out, "Usage by-user for {root}:")?;
    queue
        .by_uid()
        .summarize(out, uid_names, order, options, config.parameter)?;
    writeln!(out)?;
    writeln!(out, "Usage by-group for {root}:")?;
    queue
        .by_gid()
        .summarize(out, gid_names, order, options, config.parameter)?;
    Ok(())
}
