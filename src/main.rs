use std::io::{self, Write as _};

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info_span};

use duscan::cli::{Cli, SeedPolicyArg};
use duscan::comm::tcp::{GroupConfig, TcpGroup};
use duscan::comm::{Solo, Transport};
use duscan::coordinator::{scan_path, ScanConfig};
use duscan::names;
use duscan::path::ScanPath;
use duscan::queue::SeedPolicy;
use duscan::usage::NameFn;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exitcode::OK,
                _ => libc::EINVAL,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cli.verbosity())
        .with_writer(io::stderr)
        .with_target(false);
    if cli.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }

    let code = match GroupConfig::from_env() {
        Ok(Some(config)) => match TcpGroup::establish(&config) {
            Ok(mut group) => run(&mut group, &cli),
            Err(error) => {
                eprintln!("duscan: unable to establish the peer group: {error}");
                1
            }
        },
        Ok(None) => run(&mut Solo, &cli),
        Err(error) => {
            eprintln!("duscan: {error}");
            libc::EINVAL
        }
    };
    std::process::exit(code);
}

fn run<T: Transport>(group: &mut T, cli: &Cli) -> i32 {
    let span = info_span!("peer", rank = group.rank());
    let _guard = span.enter();

    lower_priority();

    let config = ScanConfig {
        parameter: cli.parameter,
        seed_policy: resolve_seed_policy(cli.work_queue_size, group.size()),
        splitter: cli.work_queue_split,
        sort: !cli.unsorted,
        human_readable: cli.human_readable,
        show_queue_summary: cli.work_queue_summary,
    };

    let uid_fn = |id: i32| names::uid_name(id);
    let gid_fn = |id: i32| names::gid_name(id);
    let (uid_names, gid_names): (Option<NameFn<'_>>, Option<NameFn<'_>>) = if cli.numeric {
        (None, None)
    } else {
        (Some(&uid_fn), Some(&gid_fn))
    };

    let stdout = io::stdout();
    let mut code = exitcode::OK;
    for path in &cli.paths {
        let root = ScanPath::new(path);
        let mut out = stdout.lock();
        match scan_path(group, &config, &root, &mut out, uid_names, gid_names) {
            Ok(true) => {}
            Ok(false) => code = 1,
            Err(scan_error) => {
                error!(root = %root, error = %scan_error, "abandoning path");
                code = 1;
            }
        }
        let _ = out.flush();
    }
    code
}

fn resolve_seed_policy(arg: Option<SeedPolicyArg>, peers: usize) -> Option<SeedPolicy> {
    match arg {
        None => None,
        Some(SeedPolicyArg::PathCount(None)) => Some(SeedPolicy::ByPathCount(peers)),
        Some(SeedPolicyArg::PathCount(Some(count))) => Some(SeedPolicy::ByPathCount(count)),
        Some(SeedPolicyArg::Depth(depth)) => Some(SeedPolicy::ByPathDepth(depth)),
    }
}

// Scanning is a background chore; stay out of the way unless privileged.
fn lower_priority() {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, 0, 19);
        }
    }
}
