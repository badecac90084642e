//! Variant directories: building in one directory from sources that live in
//! another.  A file under a variant directory that nothing builds is taken to
//! be a source and maps onto the same relative path in the source directory.

use crate::canon::{canon_path, join, strip_dir};

#[derive(Debug, Clone, PartialEq)]
pub struct VariantDir {
    pub variant: String,
    pub src: String,
    /// Copy sources into the variant directory rather than reading them in
    /// place.
    pub duplicate: bool,
}

#[derive(Debug, Default)]
pub struct VariantDirs {
    dirs: Vec<VariantDir>,
}

/// Where a variant path's source lives.
#[derive(Debug, PartialEq)]
pub struct SourceMapping {
    pub src_path: String,
    pub duplicate: bool,
}

impl VariantDirs {
    pub fn add(&mut self, variant: &str, src: &str, duplicate: bool) {
        let variant = canon_path(variant);
        let src = canon_path(src);
        self.dirs.retain(|d| d.variant != variant);
        self.dirs.push(VariantDir {
            variant,
            src,
            duplicate,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Maps a canonical path to its source path, using the most specific
    /// variant directory containing it.
    pub fn source_for(&self, path: &str) -> Option<SourceMapping> {
        let mut best: Option<(&VariantDir, &str)> = None;
        for dir in &self.dirs {
            if let Some(rest) = strip_dir(path, &dir.variant) {
                let better = match best {
                    Some((b, _)) => dir.variant.len() > b.variant.len(),
                    None => true,
                };
                if better {
                    best = Some((dir, rest));
                }
            }
        }
        let (dir, rest) = best?;
        let src_path = join(&dir.src, rest);
        if src_path == path {
            return None;
        }
        Some(SourceMapping {
            src_path,
            duplicate: dir.duplicate,
        })
    }
}
