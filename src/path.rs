//! Decomposed media paths and sequence discovery
//!
//! **Why**: Artists point the engine at `render.0001.exr` and expect the
//! whole sequence. Splitting a path into directory / base / frame number /
//! padding / extension makes "which file is frame 37" a string format, not a
//! directory walk.
//!
//! **Used by**: sequence I/O plugin (frame path resolution), timeline media
//! references, thumbnail service
//!
//! # Recognition
//!
//! A path is a sequence member when its filename carries a trailing digit
//! group before the extension. Zero-padded numbers fix the reconstruction
//! width (`0001` → width 4); unpadded numbers reconstruct without leading
//! zeros (`render.7.exr` → `render.101.exr`).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Filename split: base, optional trailing digits, optional dot-extension
static FILE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)(\d*)(\.[^.\\/]+)?$").expect("static regex"));

/// A filesystem reference decomposed for frame-number substitution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    directory: String,
    base: String,
    number: String,
    padding: usize,
    extension: String,
}

impl Path {
    /// Decompose a path string
    ///
    /// `"/shots/render.0100.exr"` → directory `"/shots/"`, base `"render."`,
    /// number `"0100"`, padding `4`, extension `".exr"`.
    pub fn parse(path: &str) -> Self {
        let (directory, file) = match path.rfind(['/', '\\']) {
            Some(i) => (&path[..=i], &path[i + 1..]),
            None => ("", path),
        };

        let caps = FILE_NUMBER_RE.captures(file);
        let (base, number, extension) = match caps {
            Some(c) => (
                c.get(1).map_or("", |m| m.as_str()),
                c.get(2).map_or("", |m| m.as_str()),
                c.get(3).map_or("", |m| m.as_str()),
            ),
            None => (file, "", ""),
        };

        let padding = if number.starts_with('0') && number.len() > 1 {
            number.len()
        } else {
            0
        };

        Self {
            directory: directory.to_string(),
            base: base.to_string(),
            number: number.to_string(),
            padding,
            extension: extension.to_string(),
        }
    }

    /// Rebuild the full path for a frame number
    ///
    /// Non-sequence paths ignore the argument and return themselves.
    pub fn get(&self, frame: i64) -> String {
        if self.number.is_empty() {
            return format!("{}{}{}", self.directory, self.base, self.extension);
        }
        format!(
            "{}{}{:0width$}{}",
            self.directory,
            self.base,
            frame,
            self.extension,
            width = self.padding
        )
    }

    /// Whole path as parsed
    pub fn full(&self) -> String {
        format!("{}{}{}{}", self.directory, self.base, self.number, self.extension)
    }

    pub fn is_sequence(&self) -> bool {
        !self.number.is_empty()
    }

    /// Frame number carried by the parsed filename
    pub fn frame_number(&self) -> Option<i64> {
        self.number.parse().ok()
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Lowercased extension without the leading dot
    pub fn extension(&self) -> String {
        self.extension.trim_start_matches('.').to_ascii_lowercase()
    }

    /// Discover the on-disk frame range for this sequence
    ///
    /// Globs sibling files sharing base and extension and takes min/max of
    /// their frame numbers. Single files report their own (or zero) frame.
    pub fn frame_range(&self) -> Result<(i64, i64)> {
        if !self.is_sequence() {
            let f = self.frame_number().unwrap_or(0);
            return Ok((f, f));
        }

        let pattern = format!("{}{}*{}", self.directory, self.base, self.extension);
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::InvalidArgument(format!("glob {}: {}", pattern, e)))?;

        let mut lo = i64::MAX;
        let mut hi = i64::MIN;
        for entry in paths.filter_map(std::result::Result::ok) {
            let parsed = Path::parse(&entry.to_string_lossy());
            if parsed.base == self.base && parsed.extension == self.extension {
                if let Some(n) = parsed.frame_number() {
                    lo = lo.min(n);
                    hi = hi.max(n);
                }
            }
        }

        if lo > hi {
            return Err(Error::OpenFailed(format!(
                "no frames on disk for {}",
                self.full()
            )));
        }
        Ok((lo, hi))
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_sequence() {
            write!(
                f,
                "{}{}{}{} [pad {}]",
                self.directory,
                self.base,
                "#".repeat(self.number.len()),
                self.extension,
                self.padding
            )
        } else {
            write!(f, "{}", self.full())
        }
    }
}

/// One sequence found by a directory scan, with its on-disk frame range
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    pub path: Path,
    pub start: i64,
    pub end: i64,
}

/// Scan a directory and group numbered files into sequences
///
/// Multiple sequences per directory are supported; files without a frame
/// number come back as single-frame groups. Hidden files are skipped.
pub fn scan_directory(dir: &str) -> Result<Vec<SequenceGroup>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::OpenFailed(format!("read dir {}: {}", dir, e)))?;

    // key: (base, extension) -> (representative, min, max)
    let mut grouped: HashMap<(String, String), (Path, i64, i64)> = HashMap::new();

    for entry in entries.flatten() {
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.starts_with('.') {
            continue;
        }

        let parsed = Path::parse(&p.to_string_lossy());
        let frame = parsed.frame_number().unwrap_or(0);
        let key = (parsed.base.clone(), parsed.extension.clone());

        grouped
            .entry(key)
            .and_modify(|(_, lo, hi)| {
                *lo = (*lo).min(frame);
                *hi = (*hi).max(frame);
            })
            .or_insert((parsed, frame, frame));
    }

    let mut groups: Vec<SequenceGroup> = grouped
        .into_values()
        .map(|(path, start, end)| SequenceGroup { path, start, end })
        .collect();
    groups.sort_by(|a, b| a.path.full().cmp(&b.path.full()));
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence() {
        let p = Path::parse("/shots/sc01/render.0100.exr");
        assert_eq!(p.directory(), "/shots/sc01/");
        assert_eq!(p.base(), "render.");
        assert_eq!(p.padding(), 4);
        assert_eq!(p.extension(), "exr");
        assert!(p.is_sequence());
        assert_eq!(p.frame_number(), Some(100));
    }

    #[test]
    fn test_parse_single_file() {
        let p = Path::parse("/media/poster.png");
        assert!(!p.is_sequence());
        assert_eq!(p.get(42), "/media/poster.png");
        assert_eq!(p.extension(), "png");
    }

    #[test]
    fn test_reconstruction_padded() {
        let p = Path::parse("render.0001.exr");
        assert_eq!(p.get(1), "render.0001.exr");
        assert_eq!(p.get(240), "render.0240.exr");
        assert_eq!(p.get(12345), "render.12345.exr"); // overflow widens
    }

    #[test]
    fn test_reconstruction_unpadded() {
        let p = Path::parse("shot.7.jpg");
        assert!(p.is_sequence());
        assert_eq!(p.padding(), 0);
        assert_eq!(p.get(101), "shot.101.jpg");
    }

    #[test]
    fn test_no_extension() {
        let p = Path::parse("/tmp/frames/0003");
        assert!(p.is_sequence());
        assert_eq!(p.get(5), "/tmp/frames/0005");
    }

    #[test]
    fn test_backslash_directory() {
        let p = Path::parse(r"c:\renders\aaa.0010.tif");
        assert_eq!(p.directory(), r"c:\renders\");
        assert_eq!(p.get(11), r"c:\renders\aaa.0011.tif");
    }

    #[test]
    fn test_scan_directory_groups() {
        let dir = std::env::temp_dir().join(format!("reela_scan_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for n in [1, 2, 3] {
            std::fs::write(dir.join(format!("a.{:04}.ppm", n)), b"x").unwrap();
        }
        std::fs::write(dir.join("b.ppm"), b"x").unwrap();

        let groups = scan_directory(&dir.to_string_lossy()).unwrap();
        assert_eq!(groups.len(), 2);
        let a = groups.iter().find(|g| g.path.base() == "a.").unwrap();
        assert_eq!((a.start, a.end), (1, 3));
        assert!(a.path.is_sequence());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_frame_range_from_disk() {
        let dir = std::env::temp_dir().join(format!("reela_range_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for n in [10, 11, 12, 15] {
            std::fs::write(dir.join(format!("sq.{:04}.ppm", n)), b"x").unwrap();
        }
        let p = Path::parse(&dir.join("sq.0010.ppm").to_string_lossy());
        assert_eq!(p.frame_range().unwrap(), (10, 15));
        std::fs::remove_dir_all(&dir).ok();
    }
}
