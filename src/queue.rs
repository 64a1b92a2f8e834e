//! The scan work queue.
//!
//! A `WorkQueue` holds subtree-root paths that have not yet been descended
//! into, plus the two usage trees every visited entry is tallied against.
//! [`WorkQueue::build`] walks a root just deep enough to produce a
//! partitionable list of independent subtrees; [`WorkQueue::complete`]
//! recursively accounts everything under whatever is still queued.
//!
//! Queued paths are the unit of distribution: the serialize family puts them
//! on the wire (little-endian framing), and `deserialize` reconstitutes a
//! queue with empty trees on the receiving peer.

use std::collections::VecDeque;
use std::os::unix::fs::MetadataExt;
use std::sync::{Mutex, OnceLock, PoisonError};

use byte_stream::{ByteStream, Options};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, warn};

use crate::path::ScanPath;
use crate::usage::{Parameter, UsageTree};
use crate::walk::{Entry, EntryKind, Walker};

// POSIX st_blocks unit.
const ST_NBLOCKSIZE: u64 = 512;

/// How [`WorkQueue::build`] decides it has seeded enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Expand breadth-first until at least this many paths are queued (or
    /// the tree is exhausted).
    ByPathCount(usize),
    /// Expand every queued path one level per pass, for this many passes.
    ByPathDepth(usize),
}

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("work queue decode failed: {source}"))]
    Decode { source: byte_stream::DecodeError },

    #[snafu(display("usage parameter {value} is not recognized"))]
    UnknownParameter { value: u32 },

    #[snafu(display("path range at {start} is out of bounds for {len} path(s)"))]
    RangeOutOfBounds { start: usize, len: usize },

    #[snafu(display("stride must be non-zero"))]
    ZeroStride,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    usage_parameter: Parameter,
    by_uid: UsageTree,
    by_gid: UsageTree,
    paths: VecDeque<ScanPath>,
}

// The shuffle PRNG is process-wide and seeded from OS entropy exactly once;
// failure to seed is fatal.
static SHUFFLE_RNG: OnceLock<Mutex<SmallRng>> = OnceLock::new();

fn shuffle_rng() -> &'static Mutex<SmallRng> {
    SHUFFLE_RNG.get_or_init(|| match SmallRng::try_from_os_rng() {
        Ok(rng) => Mutex::new(rng),
        Err(error) => {
            eprintln!("unable to seed the shuffle PRNG from OS entropy: {error}");
            std::process::exit(1);
        }
    })
}

impl WorkQueue {
    pub fn new(usage_parameter: Parameter) -> Self {
        WorkQueue {
            usage_parameter,
            ..WorkQueue::default()
        }
    }

    pub fn usage_parameter(&self) -> Parameter {
        self.usage_parameter
    }

    pub fn by_uid(&self) -> &UsageTree {
        &self.by_uid
    }

    pub fn by_uid_mut(&mut self) -> &mut UsageTree {
        &mut self.by_uid
    }

    pub fn by_gid(&self) -> &UsageTree {
        &self.by_gid
    }

    pub fn by_gid_mut(&mut self) -> &mut UsageTree {
        &mut self.by_gid
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn path_at(&self, index: usize) -> Option<&ScanPath> {
        self.paths.get(index)
    }

    pub fn paths(&self) -> impl Iterator<Item = &ScanPath> {
        self.paths.iter()
    }

    /// Append a path, taking ownership.
    pub fn push(&mut self, path: ScanPath) {
        self.paths.push_back(path);
    }

    /// Append a copy of `path`.
    pub fn push_copy(&mut self, path: &ScanPath) {
        self.paths.push_back(path.clone());
    }

    /// Remove `count` paths starting at `start`; out-of-range tails are
    /// clamped, an out-of-range start is a no-op.
    pub fn delete(&mut self, start: usize, count: usize) {
        if start >= self.paths.len() {
            return;
        }
        let end = start.saturating_add(count).min(self.paths.len());
        self.paths.drain(start..end);
    }

    /// Keep only paths for which `keep(index, path)` is true; indices refer
    /// to positions before any removal.
    pub fn retain(&mut self, mut keep: impl FnMut(usize, &ScanPath) -> bool) {
        let mut index = 0;
        self.paths.retain(|path| {
            let keep_this = keep(index, path);
            index += 1;
            keep_this
        });
    }

    /// Shuffle the queued paths in place, `passes` times, using the
    /// process-global entropy-seeded PRNG.
    pub fn randomize(&mut self, passes: u32) {
        let mut rng = shuffle_rng()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.randomize_with(&mut *rng, passes);
    }

    /// Shuffle with a caller-supplied PRNG; a fixed seed gives a
    /// reproducible permutation.
    pub fn randomize_with<R: Rng>(&mut self, rng: &mut R, passes: u32) {
        for _ in 0..passes {
            // Move a random survivor to the end, shrinking the draw range by
            // one each round.
            let mut draw = self.paths.len();
            while draw > 1 {
                let index = rng.random_range(0..draw);
                if let Some(path) = self.paths.remove(index) {
                    self.paths.push_back(path);
                }
                draw -= 1;
            }
        }
    }

    fn bytes_for(&self, metadata: &std::fs::Metadata) -> u64 {
        match self.usage_parameter {
            Parameter::Actual => metadata.blocks() * ST_NBLOCKSIZE,
            Parameter::Size => metadata.len(),
            Parameter::Blocks => metadata.blocks(),
        }
    }

    fn charge_entry(&mut self, entry: &Entry) {
        if let Some(metadata) = &entry.metadata {
            let bytes = self.bytes_for(metadata);
            self.by_uid.charge(metadata.uid() as i32, bytes);
            self.by_gid.charge(metadata.gid() as i32, bytes);
        }
    }

    /// Seed the queue from `root`. Returns false if any entry had to be
    /// skipped; the queue and trees are still usable.
    pub fn build(&mut self, root: &ScanPath, policy: SeedPolicy) -> bool {
        match policy {
            SeedPolicy::ByPathCount(min_count) => self.build_by_count(root, min_count),
            SeedPolicy::ByPathDepth(depth) => self.build_by_depth(root, depth),
        }
    }

    fn build_by_count(&mut self, root: &ScanPath, min_count: usize) -> bool {
        let mut clean = true;
        if self.paths.len() >= min_count {
            return clean;
        }
        self.push_copy(root);
        while !self.paths.is_empty() && self.paths.len() < min_count {
            let Some(front) = self.paths.pop_front() else {
                break;
            };
            clean &= self.expand_one_level(&front);
        }
        clean
    }

    fn build_by_depth(&mut self, root: &ScanPath, depth: usize) -> bool {
        let mut clean = true;
        self.push_copy(root);
        let mut pass = 0;
        while !self.paths.is_empty() && pass < depth {
            let snapshot: Vec<ScanPath> = self.paths.drain(..).collect();
            for path in &snapshot {
                clean &= self.expand_one_level(path);
            }
            pass += 1;
        }
        clean
    }

    // Account `root` itself, queue its immediate subdirectories, and account
    // every other immediate child.
    fn expand_one_level(&mut self, root: &ScanPath) -> bool {
        let mut clean = true;
        let mut walker = Walker::new(root.as_path());

        match walker.next() {
            None => return clean,
            Some(entry) if entry.kind.is_accounted() => self.charge_entry(&entry),
            Some(entry) => {
                warn!(
                    path = %entry.path.display(),
                    error = entry.error.as_ref().map(tracing::field::display),
                    "skipping unreadable seed path"
                );
                return false;
            }
        }

        while let Some(entry) = walker.next() {
            match entry.kind {
                EntryKind::Dir if !entry.crosses_device => {
                    debug!(path = %entry.path.display(), "queueing subtree");
                    walker.skip_current();
                    self.push(ScanPath::from(entry.path.as_path()));
                }
                // A mount point is charged where we found it but never
                // entered, in seeding and completion alike.
                EntryKind::Dir
                | EntryKind::File
                | EntryKind::Symlink
                | EntryKind::BrokenSymlink
                | EntryKind::Other => self.charge_entry(&entry),
                EntryKind::UnreadableDir | EntryKind::StatFailed => {
                    warn!(
                        path = %entry.path.display(),
                        error = entry.error.as_ref().map(tracing::field::display),
                        "skipping unreadable entry during seeding"
                    );
                    clean = false;
                }
            }
        }
        clean
    }

    /// Recursively account everything under every queued path, consuming the
    /// queue. Returns false if any entry had to be skipped; an empty queue is
    /// a successful no-op.
    pub fn complete(&mut self) -> bool {
        let mut clean = true;
        let roots: Vec<ScanPath> = self.paths.drain(..).collect();
        for root in roots {
            for entry in Walker::new(root.as_path()) {
                match entry.kind {
                    EntryKind::Dir => {
                        debug!(path = %entry.path.display(), "scanning");
                        self.charge_entry(&entry);
                    }
                    EntryKind::File
                    | EntryKind::Symlink
                    | EntryKind::BrokenSymlink
                    | EntryKind::Other => self.charge_entry(&entry),
                    EntryKind::UnreadableDir | EntryKind::StatFailed => {
                        error!(
                            path = %entry.path.display(),
                            error = entry.error.as_ref().map(tracing::field::display),
                            "skipping unreadable entry"
                        );
                        clean = false;
                    }
                }
            }
        }
        clean
    }

    /// Serialize the whole queue.
    pub fn serialize(&self) -> Result<ByteStream, QueueError> {
        self.serialize_range(0, self.paths.len())
    }

    /// Serialize `count` paths starting at `start`; the tail is clamped to
    /// the queue length.
    pub fn serialize_range(&self, start: usize, count: usize) -> Result<ByteStream, QueueError> {
        if start > self.paths.len() {
            return Err(QueueError::RangeOutOfBounds {
                start,
                len: self.paths.len(),
            });
        }
        let end = start.saturating_add(count).min(self.paths.len());
        let indices = start..end;
        self.serialize_indices((end - start) as u32, indices)
    }

    /// Serialize the subsequence `start, start + stride, start + 2·stride, …`
    /// while in bounds. Returns the stream and the number of paths emitted.
    pub fn serialize_strided(
        &self,
        start: usize,
        stride: usize,
    ) -> Result<(ByteStream, usize), QueueError> {
        if stride == 0 {
            return Err(QueueError::ZeroStride);
        }
        if start > self.paths.len() {
            return Err(QueueError::RangeOutOfBounds {
                start,
                len: self.paths.len(),
            });
        }
        let count = (self.paths.len() - start).div_ceil(stride);
        let indices = (start..self.paths.len()).step_by(stride);
        let stream = self.serialize_indices(count as u32, indices)?;
        Ok((stream, count))
    }

    fn serialize_indices(
        &self,
        count: u32,
        indices: impl Iterator<Item = usize>,
    ) -> Result<ByteStream, QueueError> {
        let mut stream = ByteStream::with_capacity(8, Options::LITTLE_ENDIAN);
        let mut emit = || -> Result<(), byte_stream::StreamError> {
            stream.append_u32(self.usage_parameter.as_u32())?;
            stream.append_u32(count)?;
            for index in indices {
                let path = &self.paths[index];
                stream.append_u64(path.len() as u64)?;
                stream.append(path.as_bytes())?;
            }
            Ok(())
        };
        emit().unwrap_or_else(|_| unreachable!("owned streams accept appends"));
        Ok(stream)
    }

    /// Invert the wire format into a fresh queue with empty trees.
    pub fn deserialize(stream: &ByteStream) -> Result<WorkQueue, QueueError> {
        let mut decoder = stream.decoder();
        let raw_parameter = decoder.u32().context(DecodeSnafu)?;
        let usage_parameter = Parameter::from_u32(raw_parameter)
            .ok_or(QueueError::UnknownParameter { value: raw_parameter })?;
        let count = decoder.u32().context(DecodeSnafu)?;

        let mut queue = WorkQueue::new(usage_parameter);
        for _ in 0..count {
            let length = decoder.u64().context(DecodeSnafu)? as usize;
            let bytes = decoder.bytes(length).context(DecodeSnafu)?;
            queue.push(ScanPath::from_bytes(bytes.to_vec()));
        }
        Ok(queue)
    }

    /// The queued paths as a single comma-separated line.
    pub fn to_csv(&self) -> String {
        self.paths
            .iter()
            .map(ScanPath::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Dump the queue state at debug level.
    pub fn summary(&self) {
        debug!(
            usage_parameter = self.usage_parameter.as_str(),
            path_count = self.paths.len(),
            "work queue"
        );
        for (index, path) in self.paths.iter().enumerate() {
            debug!("{index:>8}: \"{path}\"");
        }
    }
}
