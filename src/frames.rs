//! Picture-frame discovery and round-robin sequencing
//!
//! Frames are pre-rendered, panel-sized 1-bit images in a directory. The
//! sequencer only owns a cursor over their paths; loading and presenting a
//! frame is the scheduler's business.

use crate::config::FramesConfig;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Source of frame handles, listed in display order
pub trait FrameStore {
    fn discover(&self) -> Vec<PathBuf>;
}

/// Frames in a directory, selected by the configured pattern
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
    pattern: String,
    zero_pad: usize,
    count: usize,
}

impl DirectoryStore {
    pub fn new(config: &FramesConfig) -> Self {
        Self {
            dir: config.frames_dir(),
            pattern: config.pattern.clone(),
            zero_pad: config.zero_pad,
            count: config.count,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name of frame `n` (1-based) for `{n}` templates
    fn numbered_name(&self, n: usize) -> String {
        let number = format!("{:0width$}", n, width = self.zero_pad);
        self.pattern.replace("{n}", &number)
    }

    /// Regular files in the directory whose names satisfy `keep`, sorted by name
    fn sorted_files<F: Fn(&str) -> bool>(&self, keep: F) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.file_name().to_str().is_some_and(&keep))
            .map(|e| e.path())
            .collect();
        paths.sort();
        paths
    }
}

impl FrameStore for DirectoryStore {
    /// 1. A pattern with `*`, `?` or `[` is matched against file names.
    /// 2. Otherwise an explicit `count` expands a `{n}` template.
    /// 3. Otherwise every `.bmp` in the directory.
    fn discover(&self) -> Vec<PathBuf> {
        if self.pattern.contains(['*', '?', '[']) {
            return self.sorted_files(|name| wildcard_match(&self.pattern, name));
        }
        if self.count > 0 {
            return (1..=self.count)
                .map(|n| self.dir.join(self.numbered_name(n)))
                .collect();
        }
        self.sorted_files(|name| name.to_ascii_lowercase().ends_with(".bmp"))
    }
}

/// Shell-style match supporting `*` (any run), `?` (any one char) and
/// `[...]` classes with ranges and `!`/`^` negation. An unclosed `[` is
/// matched literally.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        let step = match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ni));
                pi += 1;
                continue;
            }
            Some('[') => match match_class(&p[pi..], n[ni]) {
                Some((hit, len)) => hit.then_some(len),
                None => (n[ni] == '[').then_some(1),
            },
            Some(&c) => (c == '?' || c == n[ni]).then_some(1),
            None => None,
        };
        match (step, backtrack) {
            (Some(len), _) => {
                pi += len;
                ni += 1;
            }
            // Let the last star swallow one more character
            (None, Some((star, matched))) => {
                pi = star + 1;
                ni = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            (None, None) => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Test `c` against the class opening `p`. Returns the outcome and the
/// class length, or `None` if there is no closing `]`.
fn match_class(p: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negate = matches!(p.get(i), Some('!' | '^'));
    if negate {
        i += 1;
    }
    let mut hit = false;
    let mut first = true;
    loop {
        let lo = *p.get(i)?;
        if lo == ']' && !first {
            break;
        }
        first = false;
        match (p.get(i + 1), p.get(i + 2)) {
            (Some('-'), Some(&hi)) if hi != ']' => {
                hit |= (lo..=hi).contains(&c);
                i += 3;
            }
            _ => {
                hit |= lo == c;
                i += 1;
            }
        }
    }
    Some((hit != negate, i + 1))
}

/// Round-robin cursor over the discovered frames
pub struct FrameSequencer<S: FrameStore> {
    store: S,
    frames: Vec<PathBuf>,
    cursor: usize,
}

impl<S: FrameStore> FrameSequencer<S> {
    /// Discover frames once and start at the first
    pub fn new(store: S) -> Self {
        let frames = store.discover();
        log_discovery(&frames);
        Self {
            store,
            frames,
            cursor: 0,
        }
    }

    /// Re-scan the store and return the new frame list
    pub fn discover(&mut self) -> &[PathBuf] {
        self.reload();
        &self.frames
    }

    /// Re-scan, keeping the cursor inside the new bounds
    pub fn reload(&mut self) {
        self.frames = self.store.discover();
        log_discovery(&self.frames);
        if self.frames.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.frames.len();
        }
    }

    pub fn current(&self) -> Option<&Path> {
        self.frames.get(self.cursor).map(PathBuf::as_path)
    }

    pub fn advance(&mut self) {
        if !self.frames.is_empty() {
            self.cursor = (self.cursor + 1) % self.frames.len();
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn log_discovery(frames: &[PathBuf]) {
    let name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    match (frames.first(), frames.last()) {
        (Some(first), Some(last)) => debug!(
            "FrameSequencer: found {} frames ({} ... {})",
            frames.len(),
            name(first),
            name(last)
        ),
        _ => debug!("FrameSequencer: found 0 frames"),
    }
}
