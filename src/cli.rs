//! Command-line surface.
//!
//! Every peer in a group is launched with the same argument vector and
//! parses it independently; the peer's rank and group shape come from the
//! environment, not from flags.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::coordinator::Splitter;
use crate::usage::Parameter;

/// Seeding selection as given on the command line. `path-count` without a
/// count defers to the peer-group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicyArg {
    PathCount(Option<usize>),
    Depth(usize),
}

#[derive(Debug, Parser)]
#[command(
    name = "duscan",
    version,
    about = "Summarize per-user and per-group disk usage under one or more paths",
    after_help = "Each <PATH> is scanned independently rather than aggregated. With a peer \
                  group configured in the environment (DUSCAN_RANK, DUSCAN_PEERS, \
                  DUSCAN_COORDINATOR), the scan is partitioned across the group and peer 0 \
                  presents the result."
)]
pub struct Cli {
    /// Decrease the amount of output shown during execution
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,

    /// Increase the amount of output shown during execution
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Display usage with units, not as raw byte counts
    #[arg(short = 'H', long = "human-readable")]
    pub human_readable: bool,

    /// Do not resolve numeric uid/gid to names
    #[arg(short = 'n', long = "numeric")]
    pub numeric: bool,

    /// Do not sort by byte usage before summarizing
    #[arg(short = 'S', long = "unsorted")]
    pub unsorted: bool,

    /// Sizing field over which to sum: actual, st_size, or st_blocks
    #[arg(
        short = 'P',
        long = "parameter",
        value_name = "PARAM",
        default_value = "actual",
        value_parser = parse_parameter
    )]
    pub parameter: Parameter,

    /// Work queue filling algorithm: path-count[=N] (default N = peer count)
    /// or depth=N
    #[arg(
        short = 'Q',
        long = "work-queue-size",
        value_name = "ALGORITHM",
        value_parser = parse_seed_policy
    )]
    pub work_queue_size: Option<SeedPolicyArg>,

    /// Method for distributing the work queue to peers
    #[arg(
        short = 'd',
        long = "work-queue-split",
        value_name = "SPLIT",
        default_value = "contiguous",
        value_parser = parse_splitter
    )]
    pub work_queue_split: Splitter,

    /// Each peer prints a CSV list of the directories it will process
    #[arg(short = 'w', long = "work-queue-summary")]
    pub work_queue_summary: bool,

    /// Prefix log lines with a timestamp
    #[arg(long = "timestamps")]
    pub timestamps: bool,

    /// Paths to scan
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,
}

impl Cli {
    /// Level filter from the default (errors only) adjusted by -v and -q.
    pub fn verbosity(&self) -> LevelFilter {
        let level = 1i16 + self.verbose as i16 - self.quiet as i16;
        match level.clamp(0, 4) {
            0 => LevelFilter::OFF,
            1 => LevelFilter::ERROR,
            2 => LevelFilter::WARN,
            3 => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        }
    }
}

fn parse_parameter(value: &str) -> Result<Parameter, String> {
    Parameter::parse(value)
        .ok_or_else(|| format!("unknown parameter '{value}' (expected actual, st_size, or st_blocks)"))
}

fn parse_splitter(value: &str) -> Result<Splitter, String> {
    Splitter::parse(value).ok_or_else(|| {
        format!("unknown split '{value}' (expected contiguous, strided, or randomized)")
    })
}

fn parse_seed_policy(value: &str) -> Result<SeedPolicyArg, String> {
    if let Some(rest) = value.strip_prefix("path-count") {
        return match rest.strip_prefix('=') {
            None if rest.is_empty() => Ok(SeedPolicyArg::PathCount(None)),
            Some(count) => count
                .parse()
                .map(|n| SeedPolicyArg::PathCount(Some(n)))
                .map_err(|_| format!("bad path count in '{value}'")),
            None => Err(format!("bad work queue size specification '{value}'")),
        };
    }
    if let Some(rest) = value.strip_prefix("depth") {
        return match rest.strip_prefix('=') {
            Some(depth) => depth
                .parse()
                .map(SeedPolicyArg::Depth)
                .map_err(|_| format!("bad depth in '{value}'")),
            None => Err(format!("depth requires a count in '{value}'")),
        };
    }
    Err(format!("bad work queue size specification '{value}'"))
}
