//! Per-entity usage tallies.
//!
//! A `UsageTree` maps a UID or GID to its accumulated byte and inode usage.
//! The primary index preserves insertion order (the "native" enumeration);
//! the by-bytes and by-inodes orderings are materialized on demand by
//! [`UsageTree::sort`] and stay empty until then.

use std::io::{self, Write};

use byte_stream::{ByteStream, Options};
use indexmap::IndexMap;
use snafu::ResultExt;
use tracing::debug;

use crate::bytefmt::human_bytes;
use crate::comm::{self, tag, CommError, Transport};

/// Which stat field becomes the "bytes" column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parameter {
    /// Physical usage: `st_blocks` scaled by the 512-byte stat block size.
    #[default]
    Actual,
    /// Logical size: `st_size`, inflated for sparse files.
    Size,
    /// Raw `st_blocks`; the bytes column becomes a block count.
    Blocks,
}

impl Parameter {
    pub fn parse(name: &str) -> Option<Parameter> {
        match name.to_ascii_lowercase().as_str() {
            "actual" => Some(Parameter::Actual),
            "st_size" => Some(Parameter::Size),
            "st_blocks" => Some(Parameter::Blocks),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Parameter::Actual => "actual",
            Parameter::Size => "st_size",
            Parameter::Blocks => "st_blocks",
        }
    }

    pub fn from_u32(value: u32) -> Option<Parameter> {
        match value {
            0 => Some(Parameter::Actual),
            1 => Some(Parameter::Size),
            2 => Some(Parameter::Blocks),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Parameter::Actual => 0,
            Parameter::Size => 1,
            Parameter::Blocks => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub entity_id: i32,
    pub byte_usage: u64,
    pub inode_usage: u64,
}

impl UsageRecord {
    fn zero(entity_id: i32) -> Self {
        UsageRecord {
            entity_id,
            byte_usage: 0,
            inode_usage: 0,
        }
    }
}

/// Enumeration order for [`UsageTree::summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOrder {
    ById,
    ByBytes,
    ByInodes,
    Native,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizeOptions {
    pub human_readable: bool,
}

/// Resolves an entity id to a display name; `None` falls back to the decimal
/// id.
pub type NameFn<'a> = &'a dyn Fn(i32) -> Option<String>;

// Reduction wire framing: one record is {i32 id, u64 bytes, u64 inodes}.
const RECORD_WIRE_LEN: usize = 4 + 8 + 8;

#[derive(Debug, Default)]
pub struct UsageTree {
    records: IndexMap<i32, UsageRecord>,
    by_bytes: Vec<i32>,
    by_inodes: Vec<i32>,
    total_bytes: u64,
    total_inodes: u64,
}

impl UsageTree {
    pub fn new() -> Self {
        UsageTree::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn lookup(&self, entity_id: i32) -> Option<&UsageRecord> {
        self.records.get(&entity_id)
    }

    /// The record for `entity_id`, created with zero usage if absent.
    pub fn lookup_or_add(&mut self, entity_id: i32) -> &mut UsageRecord {
        self.records
            .entry(entity_id)
            .or_insert_with(|| UsageRecord::zero(entity_id))
    }

    /// Account one filesystem entry against `entity_id`.
    pub fn charge(&mut self, entity_id: i32, bytes: u64) {
        let record = self.lookup_or_add(entity_id);
        record.byte_usage += bytes;
        record.inode_usage += 1;
    }

    /// Fold every record of `other` into this tree.
    pub fn update_with(&mut self, other: &UsageTree) {
        for record in other.records() {
            let ours = self.lookup_or_add(record.entity_id);
            ours.byte_usage += record.byte_usage;
            ours.inode_usage += record.inode_usage;
        }
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.records.values()
    }

    /// (Re)build the by-bytes and by-inodes orderings, largest first. Ties
    /// keep insertion order.
    pub fn sort(&mut self) {
        let mut ids: Vec<i32> = self.records.keys().copied().collect();
        ids.sort_by_key(|id| std::cmp::Reverse(self.records[id].byte_usage));
        self.by_bytes = ids.clone();
        ids.sort_by_key(|id| std::cmp::Reverse(self.records[id].inode_usage));
        self.by_inodes = ids;
    }

    pub fn calculate_totals(&mut self) {
        self.total_bytes = self.records.values().map(|r| r.byte_usage).sum();
        self.total_inodes = self.records.values().map(|r| r.inode_usage).sum();
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_inodes(&self) -> u64 {
        self.total_inodes
    }

    /// Emit one line per record in the requested order.
    pub fn summarize<W: Write>(
        &self,
        out: &mut W,
        name_fn: Option<NameFn<'_>>,
        order: TreeOrder,
        options: SummarizeOptions,
        parameter: Parameter,
    ) -> io::Result<()> {
        let sorted_ids;
        let ids: &[i32] = match order {
            TreeOrder::ById => {
                let mut ids: Vec<i32> = self.records.keys().copied().collect();
                ids.sort_unstable();
                sorted_ids = ids;
                &sorted_ids
            }
            TreeOrder::ByBytes => &self.by_bytes,
            TreeOrder::ByInodes => &self.by_inodes,
            TreeOrder::Native => {
                let ids: Vec<i32> = self.records.keys().copied().collect();
                sorted_ids = ids;
                &sorted_ids
            }
        };

        for id in ids {
            let record = &self.records[id];
            self.write_record(out, record, name_fn, options, parameter)?;
        }
        Ok(())
    }

    fn write_record<W: Write>(
        &self,
        out: &mut W,
        record: &UsageRecord,
        name_fn: Option<NameFn<'_>>,
        options: SummarizeOptions,
        parameter: Parameter,
    ) -> io::Result<()> {
        let byte_pct = 100.0 * record.byte_usage as f64 / self.total_bytes as f64;
        let inode_pct = 100.0 * record.inode_usage as f64 / self.total_inodes as f64;
        let per_inode = record.byte_usage as f64 / record.inode_usage as f64;
        let label = name_fn
            .and_then(|f| f(record.entity_id))
            .unwrap_or_else(|| record.entity_id.to_string());

        match parameter {
            Parameter::Actual | Parameter::Size if options.human_readable => writeln!(
                out,
                "{:>20} {:>24} ({:>6.2}%)  {:>24} ({:>6.2}%) @ {}/inode",
                label,
                human_bytes(record.byte_usage as f64),
                byte_pct,
                record.inode_usage,
                inode_pct,
                human_bytes(per_inode),
            ),
            Parameter::Actual | Parameter::Size => writeln!(
                out,
                "{:>20} {:>24} ({:>6.2}%)  {:>24} ({:>6.2}%) @ {:.0} B/inode",
                label, record.byte_usage, byte_pct, record.inode_usage, inode_pct, per_inode,
            ),
            Parameter::Blocks => writeln!(
                out,
                "{:>20} {:>24} ({:>6.2}%)  {:>24} ({:>6.2}%) @ {:.0} block/inode",
                label, record.byte_usage, byte_pct, record.inode_usage, inode_pct, per_inode,
            ),
        }
    }

    /// Merge every peer's records into the tree held by `root`.
    ///
    /// Non-root peers send their record count then the packed records; the
    /// root folds each batch in arrival order. All peers synchronize on a
    /// barrier before returning. After this call only the root's tree is
    /// meaningful.
    pub fn reduce<T: Transport>(&mut self, group: &mut T, root: usize) -> Result<(), CommError> {
        if group.rank() == root {
            for peer in 0..group.size() {
                if peer == root {
                    continue;
                }
                let header = group.recv(peer, tag::REDUCE_COUNT)?;
                let count = ByteStream::from_bytes(header.into(), Options::LITTLE_ENDIAN)
                    .decoder()
                    .u32()
                    .context(comm::DecodeSnafu { peer })?;
                debug!(peer, count, "received reduction record count");
                if count == 0 {
                    continue;
                }
                let payload = group.recv(peer, tag::REDUCE_RECORDS)?;
                let stream = ByteStream::from_bytes(payload.into(), Options::LITTLE_ENDIAN);
                let mut decoder = stream.decoder();
                for _ in 0..count {
                    let entity_id = decoder.i32().context(comm::DecodeSnafu { peer })?;
                    let byte_usage = decoder.u64().context(comm::DecodeSnafu { peer })?;
                    let inode_usage = decoder.u64().context(comm::DecodeSnafu { peer })?;
                    let record = self.lookup_or_add(entity_id);
                    record.byte_usage += byte_usage;
                    record.inode_usage += inode_usage;
                }
            }
        } else {
            let count = self.len() as u32;
            let mut header = ByteStream::with_capacity(4, Options::LITTLE_ENDIAN);
            header
                .append_u32(count)
                .unwrap_or_else(|_| unreachable!("owned streams accept appends"));
            group.send(root, tag::REDUCE_COUNT, header.as_slice())?;
            debug!(count, root, "sent reduction record count");

            if count > 0 {
                let mut payload = ByteStream::with_capacity(
                    self.len() * RECORD_WIRE_LEN,
                    Options::LITTLE_ENDIAN,
                );
                for record in self.records() {
                    payload
                        .append_i32(record.entity_id)
                        .and_then(|_| payload.append_u64(record.byte_usage))
                        .and_then(|_| payload.append_u64(record.inode_usage))
                        .unwrap_or_else(|_| unreachable!("owned streams accept appends"));
                }
                group.send(root, tag::REDUCE_RECORDS, payload.as_slice())?;
            }
        }
        group.barrier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_of(records: &[(i32, u64, u64)]) -> UsageTree {
        let mut tree = UsageTree::new();
        for &(id, bytes, inodes) in records {
            let record = tree.lookup_or_add(id);
            record.byte_usage = bytes;
            record.inode_usage = inodes;
        }
        tree
    }

    #[test]
    fn lookup_or_add_creates_one_zero_record() {
        let mut tree = UsageTree::new();
        assert!(tree.lookup(42).is_none());

        let record = tree.lookup_or_add(42);
        assert_eq!(record.byte_usage, 0);
        assert_eq!(record.inode_usage, 0);
        assert_eq!(tree.len(), 1);

        // Secondary orderings stay empty until sort().
        assert!(tree.by_bytes.is_empty());
        assert!(tree.by_inodes.is_empty());

        tree.lookup_or_add(42).byte_usage += 7;
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.lookup(42).unwrap().byte_usage, 7);
    }

    #[test]
    fn charge_adds_bytes_and_one_inode() {
        let mut tree = UsageTree::new();
        tree.charge(1000, 512);
        tree.charge(1000, 256);
        tree.charge(0, 10);

        let record = tree.lookup(1000).unwrap();
        assert_eq!(record.byte_usage, 768);
        assert_eq!(record.inode_usage, 2);
        assert_eq!(tree.lookup(0).unwrap().inode_usage, 1);
    }

    #[test]
    fn update_with_sums_and_creates() {
        let mut ours = tree_of(&[(1, 100, 1), (2, 200, 2)]);
        let theirs = tree_of(&[(2, 50, 1), (3, 300, 3)]);
        ours.update_with(&theirs);

        assert_eq!(ours.lookup(1).unwrap().byte_usage, 100);
        assert_eq!(ours.lookup(2).unwrap().byte_usage, 250);
        assert_eq!(ours.lookup(2).unwrap().inode_usage, 3);
        assert_eq!(ours.lookup(3).unwrap().byte_usage, 300);
        assert_eq!(ours.len(), 3);
    }

    #[test]
    fn totals_are_cached_until_recalculated() {
        let mut tree = tree_of(&[(1, 100, 1), (2, 200, 4)]);
        assert_eq!(tree.total_bytes(), 0);
        tree.calculate_totals();
        assert_eq!(tree.total_bytes(), 300);
        assert_eq!(tree.total_inodes(), 5);

        tree.charge(1, 100);
        assert_eq!(tree.total_bytes(), 300);
        tree.calculate_totals();
        assert_eq!(tree.total_bytes(), 400);
    }

    #[test]
    fn sort_orders_largest_first_with_stable_ties() {
        let mut tree = tree_of(&[(5, 10, 9), (7, 30, 1), (6, 10, 5)]);
        tree.sort();
        assert_eq!(tree.by_bytes, vec![7, 5, 6]);
        assert_eq!(tree.by_inodes, vec![5, 6, 7]);
    }

    #[test]
    fn summarize_orderings() {
        let mut tree = tree_of(&[(20, 100, 2), (10, 300, 1)]);
        tree.calculate_totals();
        tree.sort();

        let render = |order| {
            let mut out = Vec::new();
            tree.summarize(&mut out, None, order, SummarizeOptions::default(), Parameter::Size)
                .unwrap();
            String::from_utf8(out).unwrap()
        };

        let by_id = render(TreeOrder::ById);
        assert!(by_id.find("10").unwrap() < by_id.find("20").unwrap());

        let by_bytes = render(TreeOrder::ByBytes);
        assert!(by_bytes.find("300").unwrap() < by_bytes.find("100").unwrap());

        let native = render(TreeOrder::Native);
        let first = native.lines().next().unwrap();
        assert!(first.contains("100"), "insertion order leads: {first}");
    }

    #[test]
    fn summarize_empty_tree_emits_nothing() {
        let tree = UsageTree::new();
        let mut out = Vec::new();
        tree.summarize(
            &mut out,
            None,
            TreeOrder::ById,
            SummarizeOptions::default(),
            Parameter::Actual,
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn summarize_resolves_names_with_decimal_fallback() {
        let mut tree = tree_of(&[(1000, 100, 1), (2000, 200, 1)]);
        tree.calculate_totals();

        let names = |id: i32| (id == 1000).then(|| "alice".to_string());
        let mut out = Vec::new();
        tree.summarize(
            &mut out,
            Some(&names),
            TreeOrder::ById,
            SummarizeOptions::default(),
            Parameter::Size,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("alice"));
        assert!(text.contains("2000"));
    }

    #[test]
    fn blocks_parameter_labels_the_ratio() {
        let mut tree = tree_of(&[(1, 16, 2)]);
        tree.calculate_totals();
        let mut out = Vec::new();
        tree.summarize(
            &mut out,
            None,
            TreeOrder::ById,
            SummarizeOptions {
                human_readable: true,
            },
            Parameter::Blocks,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        // Block counts never get byte units, even with -H.
        assert!(text.contains("block/inode"));
        assert!(!text.contains("KiB"));
    }

    #[test]
    fn parameter_string_round_trip() {
        for parameter in [Parameter::Actual, Parameter::Size, Parameter::Blocks] {
            assert_eq!(Parameter::parse(parameter.as_str()), Some(parameter));
            assert_eq!(Parameter::from_u32(parameter.as_u32()), Some(parameter));
        }
        assert_eq!(Parameter::parse("ST_SIZE"), Some(Parameter::Size));
        assert_eq!(Parameter::parse("bogus"), None);
        assert_eq!(Parameter::from_u32(3), None);
    }
}
