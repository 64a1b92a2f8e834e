//! Depth-first directory traversal with a skip-on-request contract.
//!
//! The walker yields each entry exactly once, typed, before descending into
//! it. A caller that does not want the directory it was just handed expanded
//! calls [`Walker::skip_current`] before the next [`Walker::next`] call.
//! Symbolic links are never followed, and directories on a different device
//! than the walk root are yielded but never descended into.
//!
//! Directories are opened when they are classified, so a directory that
//! cannot be read comes back as [`EntryKind::UnreadableDir`] rather than
//! [`EntryKind::Dir`] and is never accounted.

use std::fs::{self, Metadata, ReadDir};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    BrokenSymlink,
    /// Anything else lstat can describe: fifo, socket, device node.
    Other,
    UnreadableDir,
    StatFailed,
}

impl EntryKind {
    /// Whether entries of this kind contribute to usage tallies.
    pub fn is_accounted(self) -> bool {
        !matches!(self, EntryKind::UnreadableDir | EntryKind::StatFailed)
    }
}

#[derive(Debug)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub metadata: Option<Metadata>,
    pub error: Option<io::Error>,
    /// Set on a directory that sits on a different filesystem than the walk
    /// root. It is still yielded (and tallied by callers) but never entered.
    pub crosses_device: bool,
}

impl Entry {
    fn new(path: PathBuf, kind: EntryKind, metadata: Option<Metadata>) -> Self {
        Entry {
            path,
            kind,
            metadata,
            error: None,
            crosses_device: false,
        }
    }

    fn failed(path: PathBuf, kind: EntryKind, metadata: Option<Metadata>, error: io::Error) -> Self {
        Entry {
            path,
            kind,
            metadata,
            error: Some(error),
            crosses_device: false,
        }
    }
}

pub struct Walker {
    root: PathBuf,
    root_dev: u64,
    started: bool,
    stack: Vec<(PathBuf, ReadDir)>,
    // Directory handle for the entry most recently yielded, consumed by the
    // next call to next() unless skip_current() drops it first.
    pending: Option<(PathBuf, ReadDir)>,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Walker {
            root: root.into(),
            root_dev: 0,
            started: false,
            stack: Vec::new(),
            pending: None,
        }
    }

    /// Do not descend into the directory yielded by the last `next()` call.
    pub fn skip_current(&mut self) {
        self.pending = None;
    }
}

impl Iterator for Walker {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if !self.started {
            self.started = true;
            return Some(self.classify_root());
        }
        if let Some(frame) = self.pending.take() {
            self.stack.push(frame);
        }
        loop {
            enum Step {
                Exhausted,
                Child(PathBuf),
                ReadError(PathBuf, io::Error),
            }

            let step = match self.stack.last_mut() {
                None => return None,
                Some((dir_path, entries)) => match entries.next() {
                    None => Step::Exhausted,
                    Some(Ok(child)) => Step::Child(child.path()),
                    Some(Err(error)) => Step::ReadError(dir_path.clone(), error),
                },
            };
            match step {
                Step::Exhausted => {
                    self.stack.pop();
                }
                Step::Child(path) => return Some(self.classify(path)),
                Step::ReadError(path, error) => {
                    return Some(Entry::failed(path, EntryKind::StatFailed, None, error))
                }
            }
        }
    }
}

impl Walker {
    fn classify_root(&mut self) -> Entry {
        let path = self.root.clone();
        match path.symlink_metadata() {
            Ok(metadata) => {
                self.root_dev = metadata.dev();
                self.classify_with(path, metadata)
            }
            Err(error) => Entry::failed(path, EntryKind::StatFailed, None, error),
        }
    }

    fn classify(&mut self, path: PathBuf) -> Entry {
        match path.symlink_metadata() {
            Ok(metadata) => self.classify_with(path, metadata),
            Err(error) => Entry::failed(path, EntryKind::StatFailed, None, error),
        }
    }

    fn classify_with(&mut self, path: PathBuf, metadata: Metadata) -> Entry {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let kind = if fs::metadata(&path).is_ok() {
                EntryKind::Symlink
            } else {
                EntryKind::BrokenSymlink
            };
            return Entry::new(path, kind, Some(metadata));
        }
        if file_type.is_dir() {
            if metadata.dev() != self.root_dev {
                let mut entry = Entry::new(path, EntryKind::Dir, Some(metadata));
                entry.crosses_device = true;
                return entry;
            }
            return match fs::read_dir(&path) {
                Ok(entries) => {
                    self.pending = Some((path.clone(), entries));
                    Entry::new(path, EntryKind::Dir, Some(metadata))
                }
                Err(error) => Entry::failed(path, EntryKind::UnreadableDir, Some(metadata), error),
            };
        }
        if file_type.is_file() {
            Entry::new(path, EntryKind::File, Some(metadata))
        } else {
            Entry::new(path, EntryKind::Other, Some(metadata))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io::Write as _;
    use std::os::unix::fs::symlink;

    use tempfile::tempdir;

    use super::*;

    fn touch(path: &std::path::Path, len: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![b'x'; len]).unwrap();
    }

    #[test]
    fn yields_every_entry_exactly_once() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sub")).unwrap();
        touch(&root.join("a"), 10);
        touch(&root.join("sub/b"), 20);
        symlink("a", root.join("link")).unwrap();
        symlink("missing", root.join("dangling")).unwrap();

        let mut seen = BTreeMap::new();
        for entry in Walker::new(root) {
            let name = entry
                .path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            assert!(seen.insert(name, entry.kind).is_none());
        }

        assert_eq!(seen.len(), 6);
        assert_eq!(seen[""], EntryKind::Dir);
        assert_eq!(seen["a"], EntryKind::File);
        assert_eq!(seen["sub"], EntryKind::Dir);
        assert_eq!(seen["sub/b"], EntryKind::File);
        assert_eq!(seen["link"], EntryKind::Symlink);
        assert_eq!(seen["dangling"], EntryKind::BrokenSymlink);
    }

    #[test]
    fn skip_current_prevents_descent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("deep")).unwrap();
        touch(&root.join("deep/hidden"), 1);
        touch(&root.join("shallow"), 1);

        let mut walker = Walker::new(root);
        let mut seen = Vec::new();
        while let Some(entry) = walker.next() {
            if entry.kind == EntryKind::Dir && entry.path != root {
                walker.skip_current();
            }
            seen.push(entry.path.clone());
        }

        assert!(seen.iter().any(|p| p.ends_with("deep")));
        assert!(!seen.iter().any(|p| p.ends_with("hidden")));
        assert!(seen.iter().any(|p| p.ends_with("shallow")));
    }

    #[test]
    fn root_can_be_a_plain_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("only");
        touch(&file, 100);

        let mut walker = Walker::new(&file);
        let entry = walker.next().unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.metadata.unwrap().len(), 100);
        assert!(walker.next().is_none());
    }

    #[test]
    fn missing_root_is_a_stat_failure() {
        let dir = tempdir().unwrap();
        let mut walker = Walker::new(dir.path().join("nope"));
        let entry = walker.next().unwrap();
        assert_eq!(entry.kind, EntryKind::StatFailed);
        assert!(entry.error.is_some());
        assert!(walker.next().is_none());
    }

    #[test]
    fn unreadable_directory_is_reported_not_entered() {
        use std::os::unix::fs::PermissionsExt;

        // Permission bits do not stop the superuser.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let dir = tempdir().unwrap();
        let root = dir.path();
        let locked = root.join("locked");
        fs::create_dir(&locked).unwrap();
        touch(&locked.join("unseen"), 1);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let mut kinds = BTreeMap::new();
        for entry in Walker::new(root) {
            kinds.insert(entry.path.clone(), entry.kind);
        }
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(kinds[&locked], EntryKind::UnreadableDir);
        assert!(!kinds.contains_key(&locked.join("unseen")));
    }
}
