// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::{fmt, fs, io};

use glob::Pattern;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tempfile::TempDir;

use hashing::{Fingerprint, WriterHasher};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Stat {
    Link(Link),
    Dir(Dir),
    File(File),
}

impl Stat {
    pub fn path(&self) -> &Path {
        match self {
            Stat::Dir(Dir(p)) => p.as_path(),
            Stat::File(File(p)) => p.as_path(),
            Stat::Link(Link(p)) => p.as_path(),
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Link(pub PathBuf);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Dir(pub PathBuf);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct File(pub PathBuf);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathStat {
    Dir {
        // The symbolic name of some filesystem Path, which is context specific.
        path: PathBuf,
        // The canonical Stat that underlies the Path.
        stat: Dir,
    },
    File {
        // The symbolic name of some filesystem Path, which is context specific.
        path: PathBuf,
        // The canonical Stat that underlies the Path.
        stat: File,
    },
}

impl PathStat {
    fn dir(path: PathBuf, stat: Dir) -> PathStat {
        PathStat::Dir { path, stat }
    }

    fn file(path: PathBuf, stat: File) -> PathStat {
        PathStat::File { path, stat }
    }

    pub fn path(&self) -> &Path {
        match self {
            PathStat::Dir { path, .. } => path.as_path(),
            PathStat::File { path, .. } => path.as_path(),
        }
    }
}

static SINGLE_STAR_GLOB: Lazy<Pattern> = Lazy::new(|| Pattern::new("*").unwrap());
static DOUBLE_STAR: &str = "**";
static DOUBLE_STAR_GLOB: Lazy<Pattern> = Lazy::new(|| Pattern::new("**").unwrap());

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathGlob {
    Wildcard {
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
    },
    DirWildcard {
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
        remainder: Vec<Pattern>,
    },
}

impl PathGlob {
    fn wildcard(canonical_dir: Dir, symbolic_path: PathBuf, wildcard: Pattern) -> PathGlob {
        PathGlob::Wildcard {
            canonical_dir,
            symbolic_path,
            wildcard,
        }
    }

    fn dir_wildcard(
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
        remainder: Vec<Pattern>,
    ) -> PathGlob {
        PathGlob::DirWildcard {
            canonical_dir,
            symbolic_path,
            wildcard,
            remainder,
        }
    }

    pub fn create(filespecs: &[String]) -> Result<Vec<PathGlob>, String> {
        let mut path_globs = Vec::new();
        for filespec in filespecs {
            let canonical_dir = Dir(PathBuf::new());
            let symbolic_path = PathBuf::new();
            path_globs.extend(PathGlob::parse(canonical_dir, symbolic_path, filespec)?);
        }
        Ok(path_globs)
    }

    ///
    /// Given a filespec String relative to a canonical Dir and path, split it into path
    /// components while eliminating consecutive '**'s (to avoid repetitive traversing), and
    /// parse it to a series of PathGlob objects.
    ///
    fn parse(
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        filespec: &str,
    ) -> Result<Vec<PathGlob>, String> {
        let mut parts = Vec::new();
        let mut prev_was_doublestar = false;
        for component in Path::new(filespec).components() {
            let part = match component {
                Component::Prefix(..) | Component::RootDir => {
                    return Err(format!("Absolute paths not supported: {filespec:?}"))
                }
                Component::ParentDir => {
                    return Err(format!(
                        "Globs may not traverse outside the build root: {filespec:?}"
                    ))
                }
                Component::CurDir => continue,
                c => c.as_os_str(),
            };

            // Ignore repeated doublestar instances.
            let cur_is_doublestar = DOUBLE_STAR == part;
            if prev_was_doublestar && cur_is_doublestar {
                continue;
            }
            prev_was_doublestar = cur_is_doublestar;

            // NB: Because the filespec is a String input, calls to `to_string_lossy` are not
            // lossy; the use of `Path` is strictly for os-independent Path parsing.
            parts.push(
                Pattern::new(&part.to_string_lossy())
                    .map_err(|e| format!("Could not parse {filespec:?} as a glob: {e:?}"))?,
            );
        }

        PathGlob::parse_globs(canonical_dir, symbolic_path, &parts)
    }

    ///
    /// Given a filespec as Patterns, create a series of PathGlob objects.
    ///
    fn parse_globs(
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        parts: &[Pattern],
    ) -> Result<Vec<PathGlob>, String> {
        if parts.is_empty() {
            Ok(vec![])
        } else if DOUBLE_STAR == parts[0].as_str() {
            if parts.len() == 1 {
                // Per https://git-scm.com/docs/gitignore:
                //  "A trailing '/**' matches everything inside. For example, 'abc/**' matches
                //   all files inside directory "abc", relative to the location of the
                //   .gitignore file, with infinite depth."
                return Ok(vec![
                    PathGlob::dir_wildcard(
                        canonical_dir.clone(),
                        symbolic_path.clone(),
                        SINGLE_STAR_GLOB.clone(),
                        vec![DOUBLE_STAR_GLOB.clone()],
                    ),
                    PathGlob::wildcard(canonical_dir, symbolic_path, SINGLE_STAR_GLOB.clone()),
                ]);
            }

            // There is a double-wildcard in a dirname of the path: double wildcards are
            // recursive, so there are two remainder possibilities: one with the double wildcard
            // included, and the other without.
            let pathglob_with_doublestar = PathGlob::dir_wildcard(
                canonical_dir.clone(),
                symbolic_path.clone(),
                SINGLE_STAR_GLOB.clone(),
                parts[0..].to_vec(),
            );
            let pathglob_no_doublestar = if parts.len() == 2 {
                PathGlob::wildcard(canonical_dir, symbolic_path, parts[1].clone())
            } else {
                PathGlob::dir_wildcard(
                    canonical_dir,
                    symbolic_path,
                    parts[1].clone(),
                    parts[2..].to_vec(),
                )
            };
            Ok(vec![pathglob_with_doublestar, pathglob_no_doublestar])
        } else if parts.len() == 1 {
            // This is the path basename.
            Ok(vec![PathGlob::wildcard(
                canonical_dir,
                symbolic_path,
                parts[0].clone(),
            )])
        } else {
            // This is a path dirname.
            Ok(vec![PathGlob::dir_wildcard(
                canonical_dir,
                symbolic_path,
                parts[0].clone(),
                parts[1..].to_vec(),
            )])
        }
    }
}

#[derive(Clone, Debug)]
pub struct PathGlobs {
    pub include: Vec<PathGlob>,
    pub exclude: Vec<PathGlob>,
}

impl PathGlobs {
    pub fn create(include: &[String], exclude: &[String]) -> Result<PathGlobs, String> {
        Ok(PathGlobs {
            include: PathGlob::create(include)?,
            exclude: PathGlob::create(exclude)?,
        })
    }
}

///
/// Translates a shell-style glob to a Regex that matches paths relative to the build root.
///
/// The substitutions are applied in order; a trailing `/` is rewritten so that both the
/// directory and its contents match, and a leading `/` anchors the pattern to the build root
/// (all matching is from the start of the path).
///
pub fn glob_to_regex(glob: &str) -> Result<Regex, String> {
    let mut pattern = glob
        .replace('?', ".")
        .replace('.', "\\.")
        .replace("**/", "(?:.*/)?")
        .replace('*', "[^/]*");

    // Treat trailing slashes as "the dir and everything beneath it".
    if let Some(stripped) = pattern.strip_suffix('/') {
        pattern = format!("{stripped}(/.*|$)");
    }

    if let Some(stripped) = pattern.strip_prefix('/') {
        pattern = stripped.to_string();
    }

    Regex::new(&format!("^(?:{pattern})"))
        .map_err(|e| format!("Failed to translate glob {glob:?} to a regex: {e}"))
}

///
/// The filesystem under the build root, with gitignore-style exclusion applied to every
/// listing. All paths are build-root-relative; operations are synchronous and are expected to
/// run on the scheduler's worker pool.
///
pub struct PosixFS {
    build_root: Dir,
    ignore: Gitignore,
}

impl PosixFS {
    pub fn new(build_root: PathBuf, ignore_patterns: Vec<String>) -> Result<PosixFS, String> {
        let canonical_build_root = build_root
            .canonicalize()
            .and_then(|canonical| {
                canonical.metadata().and_then(|metadata| {
                    if metadata.is_dir() {
                        Ok(Dir(canonical))
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "Not a directory.",
                        ))
                    }
                })
            })
            .map_err(|e| format!("Could not canonicalize build root {build_root:?}: {e:?}"))?;

        let ignore = PosixFS::create_ignore(&canonical_build_root, &ignore_patterns)
            .map_err(|e| {
                format!("Could not parse build ignore inputs {ignore_patterns:?}: {e:?}")
            })?;
        Ok(PosixFS {
            build_root: canonical_build_root,
            ignore,
        })
    }

    fn create_ignore(root: &Dir, patterns: &[String]) -> Result<Gitignore, ignore::Error> {
        let mut ignore_builder = GitignoreBuilder::new(root.0.as_path());
        for pattern in patterns {
            ignore_builder.add_line(None, pattern.as_str())?;
        }
        ignore_builder.build()
    }

    pub fn build_root(&self) -> &Dir {
        &self.build_root
    }

    pub fn is_ignored<P: AsRef<Path>>(&self, path: P, is_dir: bool) -> bool {
        match self.ignore.matched(path, is_dir) {
            ignore::Match::None | ignore::Match::Whitelist(_) => false,
            ignore::Match::Ignore(_) => true,
        }
    }

    pub fn read_link(&self, link: &Link) -> Result<PathBuf, io::Error> {
        let link_abs = self.build_root.0.join(link.0.as_path());
        let path_buf = link_abs.read_link()?;
        if path_buf.is_absolute() {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Absolute symlink: {link_abs:?}"),
            ))
        } else {
            link.0
                .parent()
                .map(|parent| parent.join(&path_buf))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Symlink without a parent?: {link_abs:?}"),
                    )
                })
        }
    }

    pub fn scandir(&self, dir: &Dir) -> Result<Vec<Stat>, io::Error> {
        let dir_abs = self.build_root.0.join(dir.0.as_path());
        let mut stats = Vec::new();
        for dir_entry_res in dir_abs.read_dir()? {
            let dir_entry = dir_entry_res?;
            let path = dir.0.join(dir_entry.file_name());
            let file_type = dir_entry.file_type()?;
            if file_type.is_symlink() {
                stats.push(Stat::Link(Link(path)));
            } else if file_type.is_dir() {
                stats.push(Stat::Dir(Dir(path)));
            } else if file_type.is_file() {
                stats.push(Stat::File(File(path)));
            }
            // Else: ignore.
        }
        stats.sort_by(|s1, s2| s1.path().cmp(s2.path()));
        Ok(stats)
    }

    ///
    /// Canonicalize the Link for the given Path to an underlying File or Dir. May result in
    /// None if the link is broken, or points at something that is neither.
    ///
    /// Skips ignored paths both before and after expansion.
    ///
    /// TODO: Should handle symlink loops, which currently recurse until the link chain ends.
    ///
    fn canonicalize(&self, symbolic_path: PathBuf, link: &Link) -> Result<Option<PathStat>, String> {
        // Read the link, which may result in PathGlob(s) that match 0 or 1 Path.
        let dest_path = self
            .read_link(link)
            .map_err(|e| format!("Failed to read link {link:?}: {e}"))?;
        // If the link destination can't be parsed as PathGlob(s), it is broken.
        let link_globs = dest_path
            .to_str()
            .and_then(|dest_str| {
                let escaped = Pattern::escape(dest_str);
                PathGlob::create(&[escaped]).ok()
            })
            .unwrap_or_default();
        let mut path_stats = self.expand_multi(link_globs)?;
        // Since we've escaped any globs in the parsed path, expect either 0 or 1 destination.
        Ok(path_stats.pop().map(|ps| match ps {
            PathStat::Dir { stat, .. } => PathStat::dir(symbolic_path, stat),
            PathStat::File { stat, .. } => PathStat::file(symbolic_path, stat),
        }))
    }

    fn directory_listing(
        &self,
        canonical_dir: &Dir,
        symbolic_path: &Path,
        wildcard: &Pattern,
    ) -> Result<Vec<PathStat>, String> {
        // List the directory. A directory that has disappeared (or never existed) produces an
        // empty listing rather than a failure: globs are permitted to match nothing.
        let dir_listing = match self.scandir(canonical_dir) {
            Ok(listing) => listing,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => vec![],
            Err(e) => return Err(format!("Failed to scan {canonical_dir:?}: {e}")),
        };

        // Match any relevant Stats, and join them into PathStats, canonicalizing links and
        // filtering ignored paths. Note that links are ignore-checked both before and after
        // expansion.
        let mut path_stats = Vec::new();
        for stat in dir_listing {
            let file_name = match stat.path().file_name() {
                Some(file_name) => file_name.to_owned(),
                None => continue,
            };
            if !wildcard.matches_path(Path::new(&file_name)) {
                continue;
            }
            let stat_symbolic_path = symbolic_path.join(&file_name);
            match stat {
                Stat::Link(l) => {
                    if !self.is_ignored(l.0.as_path(), false) {
                        if let Some(path_stat) = self.canonicalize(stat_symbolic_path, &l)? {
                            path_stats.push(path_stat);
                        }
                    }
                }
                Stat::Dir(d) => {
                    if !self.is_ignored(d.0.as_path(), true) {
                        path_stats.push(PathStat::dir(stat_symbolic_path, d));
                    }
                }
                Stat::File(f) => {
                    if !self.is_ignored(f.0.as_path(), false) {
                        path_stats.push(PathStat::file(stat_symbolic_path, f));
                    }
                }
            }
        }
        Ok(path_stats)
    }

    ///
    /// Recursively expands PathGlobs into PathStats while applying excludes.
    ///
    pub fn expand(&self, path_globs: &PathGlobs) -> Result<Vec<PathStat>, String> {
        let include = self.expand_multi(path_globs.include.clone())?;
        if path_globs.exclude.is_empty() {
            return Ok(include);
        }
        let exclude_set: HashSet<PathStat> =
            self.expand_multi(path_globs.exclude.clone())?.into_iter().collect();
        Ok(include
            .into_iter()
            .filter(|i| !exclude_set.contains(i))
            .collect())
    }

    ///
    /// Recursively expands PathGlobs into distinct PathStats, in a stable order.
    ///
    fn expand_multi(&self, path_globs: Vec<PathGlob>) -> Result<Vec<PathStat>, String> {
        if path_globs.is_empty() {
            return Ok(vec![]);
        }

        // Globs that have yet to be expanded, in order; globs that have already been expanded;
        // and unique Paths that have been matched, in order.
        let mut todo = path_globs;
        let mut completed: HashSet<PathGlob> = HashSet::new();
        let mut outputs: IndexMap<PathStat, ()> = IndexMap::new();
        while !todo.is_empty() {
            let round = std::mem::take(&mut todo);
            for path_glob in round {
                let (paths, globs) = self.expand_single(path_glob)?;
                outputs.extend(paths.into_iter().map(|p| (p, ())));
                todo.extend(globs.into_iter().filter(|pg| completed.insert(pg.clone())));
            }
        }
        Ok(outputs.into_keys().collect())
    }

    ///
    /// Apply a PathGlob, returning PathStats and additional PathGlobs that are needed for the
    /// expansion.
    ///
    fn expand_single(&self, path_glob: PathGlob) -> Result<(Vec<PathStat>, Vec<PathGlob>), String> {
        match path_glob {
            PathGlob::Wildcard {
                canonical_dir,
                symbolic_path,
                wildcard,
            } =>
            // Filter directory listing to return PathStats, with no continuation.
            {
                Ok((
                    self.directory_listing(&canonical_dir, &symbolic_path, &wildcard)?,
                    vec![],
                ))
            }
            PathGlob::DirWildcard {
                canonical_dir,
                symbolic_path,
                wildcard,
                remainder,
            } => {
                // Filter directory listing and request additional PathGlobs for matched Dirs.
                let mut path_globs = Vec::new();
                for path_stat in
                    self.directory_listing(&canonical_dir, &symbolic_path, &wildcard)?
                {
                    if let PathStat::Dir { path, stat } = path_stat {
                        path_globs.extend(PathGlob::parse_globs(stat, path, &remainder)?);
                    }
                }
                Ok((vec![], path_globs))
            }
        }
    }
}

pub struct FileContent {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

#[derive(Clone)]
pub struct Snapshot {
    pub fingerprint: Fingerprint,
    pub path_stats: Vec<PathStat>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Snapshot({}, entries={})",
            self.fingerprint.to_hex(),
            self.path_stats.len()
        )
    }
}

// Like std::fs::create_dir_all, except handles concurrent calls among multiple
// threads or processes. Originally lifted from rustc.
fn safe_create_dir_all_ioerror(path: &Path) -> Result<(), io::Error> {
    match fs::create_dir(path) {
        Ok(()) => return Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    match path.parent() {
        Some(p) => safe_create_dir_all_ioerror(p)?,
        None => return Ok(()),
    }
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn safe_create_dir_all(path: &Path) -> Result<(), String> {
    safe_create_dir_all_ioerror(path)
        .map_err(|e| format!("Failed to create dir {path:?} due to {e:?}"))
}

fn safe_create_tmpdir_in(base_dir: &Path, prefix: &str) -> Result<TempDir, String> {
    safe_create_dir_all(base_dir)?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(base_dir)
        .map_err(|e| format!("Failed to create tempdir in {base_dir:?} due to {e:?}"))
}

///
/// A facade for the snapshot directory, which lives under the work dir.
///
/// Snapshots are deterministic tar files named for the fingerprint of their byte stream, so
/// re-snapshotting an unchanged tree is a no-op, and content reads do not touch the live tree.
///
pub struct Snapshots {
    snapshots_dir: PathBuf,
    snapshots_generator: Mutex<(TempDir, usize)>,
}

impl Snapshots {
    pub fn new(snapshots_dir: PathBuf) -> Result<Snapshots, String> {
        let snapshots_tmpdir = safe_create_tmpdir_in(&snapshots_dir, ".tmp")?;

        Ok(Snapshots {
            snapshots_dir,
            snapshots_generator: Mutex::new((snapshots_tmpdir, 0)),
        })
    }

    pub fn snapshot_path(&self) -> &Path {
        self.snapshots_dir.as_path()
    }

    fn next_temp_path(&self) -> Result<PathBuf, String> {
        let mut gen = self.snapshots_generator.lock();
        gen.1 += 1;

        // N.B. The tempdir created at startup can be removed out from under us by a clean-all
        // style task. Double check existence of the TempDir's path when it is accessed, and
        // replace if necessary.
        if !gen.0.path().exists() {
            gen.0 = safe_create_tmpdir_in(&self.snapshots_dir, ".tmp")?;
        }

        Ok(gen.0.path().join(format!("{}.tmp", gen.1)))
    }

    ///
    /// A non-canonical (does not expand symlinks) in-memory form of normalize. Used to collapse
    /// cur-dir components, which are legal in symbolic paths in PathStats, but not in tar files.
    ///
    fn normalize(path: &Path) -> Result<PathBuf, String> {
        let mut res = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(..) | Component::RootDir => {
                    return Err(format!("Absolute paths not supported: {path:?}"))
                }
                Component::ParentDir => {
                    return Err(format!("Paths may not traverse outside the root: {path:?}"))
                }
                Component::CurDir => continue,
                Component::Normal(p) => res.push(p),
            }
        }
        Ok(res)
    }

    ///
    /// Create a tar file on the given Write instance containing the given paths, or return an
    /// error string.
    ///
    fn tar_create<W: io::Write>(
        dest: W,
        paths: &[PathStat],
        relative_to: &Dir,
    ) -> Result<W, String> {
        let mut tar_builder = tar::Builder::new(dest);
        tar_builder.mode(tar::HeaderMode::Deterministic);
        for path_stat in paths {
            // Append the PathStat using the symbolic name and underlying stat.
            let append_res = match path_stat {
                PathStat::File { path, stat } => {
                    let normalized = Snapshots::normalize(path)?;
                    let mut input = fs::File::open(relative_to.0.join(stat.0.as_path()))
                        .map_err(|e| format!("Failed to open {path_stat:?}: {e:?}"))?;
                    tar_builder.append_file(normalized, &mut input)
                }
                PathStat::Dir { path, stat } => {
                    let normalized = Snapshots::normalize(path)?;
                    tar_builder.append_dir(normalized, relative_to.0.join(stat.0.as_path()))
                }
            };
            append_res.map_err(|e| format!("Failed to tar {path_stat:?}: {e:?}"))?;
        }

        // Finish the tar file, returning ownership of the stream to the caller.
        tar_builder
            .into_inner()
            .map_err(|e| format!("Failed to finalize snapshot tar: {e:?}"))
    }

    ///
    /// Create a tar file at the given dest Path containing the given paths, while
    /// fingerprinting the written stream.
    ///
    fn tar_create_fingerprinted(
        dest: &Path,
        paths: &[PathStat],
        relative_to: &Dir,
    ) -> Result<Fingerprint, String> {
        // Wrap buffering around a fingerprinted stream above a File.
        let stream = io::BufWriter::new(WriterHasher::new(
            fs::File::create(dest)
                .map_err(|e| format!("Failed to create destination file: {e:?}"))?,
        ));

        // Then append the tar to the stream, and retrieve the Fingerprint to flush all writers.
        let (fingerprint, _) = Snapshots::tar_create(stream, paths, relative_to)?
            .into_inner()
            .map_err(|e| format!("Failed to flush to {dest:?}: {:?}", e.error()))?
            .finish();
        Ok(fingerprint)
    }

    ///
    /// Attempts to rename src to dst, and _succeeds_ if dst already exists. This is safe in
    /// the case of Snapshots because the destination path is unique to its content.
    ///
    fn finalize(temp_path: &Path, dest_path: &Path) -> Result<(), String> {
        if dest_path.is_file() {
            // The Snapshot has already been created.
            fs::remove_file(temp_path).unwrap_or(());
            Ok(())
        } else {
            let dest_dir = dest_path
                .parent()
                .expect("All snapshot paths must have parent directories.");
            safe_create_dir_all(dest_dir)?;
            match fs::rename(temp_path, dest_path) {
                Ok(_) => Ok(()),
                Err(_) if dest_path.is_file() => Ok(()),
                Err(e) => Err(format!("Failed to finalize snapshot at {dest_path:?}: {e:?}")),
            }
        }
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        Snapshots::path_under_for(self.snapshot_path(), fingerprint)
    }

    fn path_under_for(path: &Path, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        path.join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{hex}.tar"))
    }

    ///
    /// Creates a Snapshot for the given paths under the given PosixFS.
    ///
    pub fn create(&self, fs: &PosixFS, paths: Vec<PathStat>) -> Result<Snapshot, String> {
        let temp_path = self.next_temp_path()?;

        // Write the tar deterministically to a temporary file while fingerprinting.
        let fingerprint =
            Snapshots::tar_create_fingerprinted(temp_path.as_path(), &paths, fs.build_root())?;

        // Rename to the final path if it does not already exist.
        Snapshots::finalize(
            temp_path.as_path(),
            Snapshots::path_under_for(self.snapshot_path(), &fingerprint).as_path(),
        )?;

        Ok(Snapshot {
            fingerprint,
            path_stats: paths,
        })
    }

    ///
    /// Reads the contents of all files in the identified Snapshot from its archive, without
    /// touching the live tree.
    ///
    pub fn contents_for(&self, fingerprint: Fingerprint) -> Result<Vec<FileContent>, String> {
        let archive_path = self.path_for(&fingerprint);
        let file = fs::File::open(&archive_path)
            .map_err(|e| format!("Failed to open Snapshot {}: {e:?}", fingerprint.to_hex()))?;
        let mut archive = tar::Archive::new(file);

        let mut files_content = Vec::new();
        for entry_res in archive
            .entries()
            .map_err(|e| format!("Failed to read Snapshot archive {archive_path:?}: {e:?}"))?
        {
            let mut entry =
                entry_res.map_err(|e| format!("Failed to read Snapshot entry: {e:?}"))?;
            if entry.header().entry_type() != tar::EntryType::file() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| format!("Snapshot entry had an invalid path: {e:?}"))?
                .to_path_buf();
            let mut content = Vec::new();
            io::Read::read_to_end(&mut entry, &mut content)
                .map_err(|e| format!("Failed to read Snapshot entry {path:?}: {e:?}"))?;
            files_content.push(FileContent { path, content });
        }
        Ok(files_content)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::{glob_to_regex, Dir, PathGlob, PathGlobs, PathStat, PosixFS, Snapshots, Stat};

    fn assert_rule_match(glob: &str, expected_matches: &[&str]) {
        let regex = glob_to_regex(glob).unwrap();
        for expected in expected_matches {
            assert!(
                regex.is_match(expected),
                "glob_to_regex(`{glob}`) -> `{regex}` doesn't match path `{expected}`",
            );
        }
    }

    fn assert_not_rule_match(glob: &str, unexpected_matches: &[&str]) {
        let regex = glob_to_regex(glob).unwrap();
        for unexpected in unexpected_matches {
            assert!(
                !regex.is_match(unexpected),
                "glob_to_regex(`{glob}`) -> `{regex}` erroneously matches path `{unexpected}`",
            );
        }
    }

    #[test]
    fn glob_to_regex_wildcard() {
        assert_rule_match("a/b/*/f.py", &["a/b/c/f.py", "a/b/q/f.py"]);
        assert_not_rule_match("a/b/*/f.py", &["a/b/c/d/f.py", "a/b/c/d/e/f.py"]);
    }

    #[test]
    fn glob_to_regex_wildcard_anchored() {
        assert_rule_match("/foo/bar/*", &["foo/bar/baz", "foo/bar/bar"]);
        assert_rule_match("/*/bar/b*", &["foo/bar/baz", "foo/bar/bar"]);
        assert_rule_match("/foo*/bar", &["foofighters/bar", "foofighters.venv/bar"]);
        assert_not_rule_match("/foo*/bar", &["foofighters/baz/bar"]);
    }

    #[test]
    fn glob_to_regex_dots() {
        assert_rule_match("/.*", &[".", "..", ".pids", ".some/hidden/nested/dir/file.py"]);
        assert_not_rule_match("/.*", &["a", "a/.non/anchored/dot/dir/path.py", "dist"]);
        assert_not_rule_match(
            ".*",
            &["a", "a/non/dot/dir/file.py", "dist", "all/nested/.dot/dir/paths"],
        );
    }

    #[test]
    fn glob_to_regex_dirs() {
        assert_rule_match("dist/", &["dist", "dist/nested/path.py", "dist/another/nested/dir"]);
        assert_not_rule_match("dist/", &["not_dist", "cdist", "dist.py", "nested/dist/dir.py"]);
    }

    #[test]
    fn glob_to_regex_dirs_dots() {
        assert_rule_match(
            "build-support/*.venv/",
            &[
                "build-support/*.venv",
                "build-support/rbt.venv/setup.py",
                "build-support/isort.venv/bin/isort",
            ],
        );
        assert_not_rule_match(
            "build-support/*.venv/",
            &["build-support/rbt.venv.but_actually_a_file"],
        );
    }

    #[test]
    fn glob_to_regex_literals() {
        assert_rule_match("a", &["a"]);
        assert_rule_match("a/b/c", &["a/b/c"]);
        assert_rule_match("a/b/c.py", &["a/b/c.py"]);
    }

    #[test]
    fn path_glob_rejects_absolute_and_parent() {
        assert!(PathGlob::create(&["/absolute/*.rs".to_string()]).is_err());
        assert!(PathGlob::create(&["../up/*.rs".to_string()]).is_err());
        assert!(PathGlob::create(&["ok/../sneaky".to_string()]).is_err());
    }

    fn setup_tree() -> (TempDir, PosixFS) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/1.txt"), "one").unwrap();
        fs::write(root.join("a/2.log"), "two").unwrap();
        fs::write(root.join("a/b/3.txt"), "three").unwrap();
        let posix_fs = PosixFS::new(root.to_owned(), vec![]).unwrap();
        (dir, posix_fs)
    }

    fn expand_paths(posix_fs: &PosixFS, include: &[&str]) -> Vec<PathBuf> {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let globs = PathGlobs::create(&include, &[]).unwrap();
        posix_fs
            .expand(&globs)
            .unwrap()
            .into_iter()
            .map(|ps| ps.path().to_owned())
            .collect()
    }

    #[test]
    fn expand_single_level() {
        let (_dir, posix_fs) = setup_tree();
        assert_eq!(expand_paths(&posix_fs, &["a/*.txt"]), vec![PathBuf::from("a/1.txt")]);
    }

    #[test]
    fn expand_recursive() {
        let (_dir, posix_fs) = setup_tree();
        let paths = expand_paths(&posix_fs, &["a/**"]);
        assert!(paths.contains(&PathBuf::from("a/1.txt")));
        assert!(paths.contains(&PathBuf::from("a/b/3.txt")));
    }

    #[test]
    fn expand_applies_excludes() {
        let (_dir, posix_fs) = setup_tree();
        let include: Vec<String> = vec!["a/*".to_string()];
        let exclude: Vec<String> = vec!["a/*.log".to_string()];
        let globs = PathGlobs::create(&include, &exclude).unwrap();
        let paths: Vec<PathBuf> = posix_fs
            .expand(&globs)
            .unwrap()
            .into_iter()
            .map(|ps| ps.path().to_owned())
            .collect();
        assert!(paths.contains(&PathBuf::from("a/1.txt")));
        assert!(!paths.contains(&PathBuf::from("a/2.log")));
    }

    #[test]
    fn expand_applies_ignore_patterns() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a/keep.txt"), "keep").unwrap();
        fs::write(root.join("a/skip.pyc"), "skip").unwrap();
        let posix_fs = PosixFS::new(root.to_owned(), vec!["*.pyc".to_string()]).unwrap();
        assert_eq!(expand_paths(&posix_fs, &["a/*"]), vec![PathBuf::from("a/keep.txt")]);
    }

    #[test]
    fn expand_follows_links() {
        let (_dir, posix_fs) = setup_tree();
        std::os::unix::fs::symlink("1.txt", _dir.path().join("a/link.txt")).unwrap();
        let paths = expand_paths(&posix_fs, &["a/link*"]);
        // The symbolic path is preserved; the underlying stat is the link target.
        assert_eq!(paths, vec![PathBuf::from("a/link.txt")]);
    }

    #[test]
    fn scandir_is_sorted() {
        let (_dir, posix_fs) = setup_tree();
        let stats = posix_fs.scandir(&Dir(PathBuf::from("a"))).unwrap();
        let paths: Vec<&Path> = stats.iter().map(Stat::path).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn snapshot_round_trip() {
        let (dir, posix_fs) = setup_tree();
        let snapshots_dir = TempDir::new().unwrap();
        let snapshots = Snapshots::new(snapshots_dir.path().join("snapshots")).unwrap();

        let globs = PathGlobs::create(&["a/**".to_string()], &[]).unwrap();
        let path_stats = posix_fs.expand(&globs).unwrap();
        let snapshot = snapshots.create(&posix_fs, path_stats.clone()).unwrap();

        // Snapshotting an unchanged tree is stable.
        let again = snapshots.create(&posix_fs, path_stats).unwrap();
        assert_eq!(snapshot.fingerprint, again.fingerprint);

        // Content reads come from the archive.
        let contents = snapshots.contents_for(snapshot.fingerprint).unwrap();
        let one = contents
            .iter()
            .find(|fc| fc.path == Path::new("a/1.txt"))
            .unwrap();
        assert_eq!(one.content, b"one");

        // A content change produces a different snapshot.
        fs::write(dir.path().join("a/1.txt"), "one!").unwrap();
        let globs = PathGlobs::create(&["a/**".to_string()], &[]).unwrap();
        let changed = snapshots
            .create(&posix_fs, posix_fs.expand(&globs).unwrap())
            .unwrap();
        assert_ne!(snapshot.fingerprint, changed.fingerprint);
    }

    #[test]
    fn path_stats_preserve_expansion_order() {
        let (_dir, posix_fs) = setup_tree();
        let globs = PathGlobs::create(&["a/*.txt".to_string(), "a/*.log".to_string()], &[])
            .unwrap();
        let paths: Vec<PathBuf> = posix_fs
            .expand(&globs)
            .unwrap()
            .into_iter()
            .map(|ps| match ps {
                PathStat::Dir { path, .. } => path,
                PathStat::File { path, .. } => path,
            })
            .collect();
        assert_eq!(paths, vec![PathBuf::from("a/1.txt"), PathBuf::from("a/2.log")]);
    }
}
