//! Developer disk image lookup.
//!
//! Finds disk images for an iOS product version within a directory that has
//! the structure of the Xcode `iPhoneOS.platform/DeviceSupport` directory:
//! any number of image subdirectories named after an iOS version, each
//! containing a single `.dmg` image and a single `.signature` file.
//!
//! Misconfiguration of the image root is fatal: these methods panic rather
//! than return an error, since no device operation can proceed without a
//! mountable image.

use std::path::{Path, PathBuf};

const IMAGE_EXTENSION: &str = "dmg";
const SIGNATURE_EXTENSION: &str = "signature";

#[derive(Clone, Debug)]
pub struct DevDiskImages {
    root: PathBuf,
}

/// A matched image and its signature file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskImage {
    pub image: PathBuf,
    pub signature: PathBuf,
}

impl DevDiskImages {
    pub fn in_directory(root: impl Into<PathBuf>) -> Self {
        DevDiskImages { root: root.into() }
    }

    /// Finds the disk image best matching the given product version.
    ///
    /// Both the version and each candidate directory name are reduced to
    /// their leading dotted number sequence; the candidate sharing the
    /// longest common prefix of version components wins, provided at least
    /// major and minor match. Ties go to the earlier directory in
    /// enumeration order (sorted by name for determinism).
    ///
    /// # Panics
    /// Panics if no directory matches or the matched directory does not
    /// contain exactly one readable image and signature pair.
    pub fn find_for_version(&self, ios_version: &str) -> DiskImage {
        let version_nums = split_version_string(ios_version)
            .unwrap_or_else(|| panic!("invalid product version string: {ios_version}"));

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .unwrap_or_else(|e| {
                panic!(
                    "error finding developer disk image under {}: {e}",
                    self.root.display()
                )
            })
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        let mut best_match: Option<&Path> = None;
        let mut max_matching = 0;
        for dir in &entries {
            let name = dir.file_name().unwrap_or_default().to_string_lossy();
            if let Some(dir_nums) = split_version_string(&name) {
                let matching = common_prefix_len(&version_nums, &dir_nums);
                // A usable directory matches at least major.minor.
                if matching > max_matching && matching > 1 {
                    best_match = Some(dir);
                    max_matching = matching;
                }
            }
        }

        let image_dir = best_match
            .unwrap_or_else(|| panic!("no disk image directory found for version: {ios_version}"));
        DiskImage {
            image: find_only_file_with_extension(image_dir, IMAGE_EXTENSION),
            signature: find_only_file_with_extension(image_dir, SIGNATURE_EXTENSION),
        }
    }
}

/// The leading `\d+(\.\d+)+` token of a name, split on dots; `None` when
/// the name does not start with at least two dotted components.
fn split_version_string(name: &str) -> Option<Vec<String>> {
    let token: String = name
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let token = token.trim_end_matches('.');
    let parts: Vec<String> = token.split('.').map(str::to_string).collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    Some(parts)
}

fn common_prefix_len(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn find_only_file_with_extension(dir: &Path, extension: &str) -> PathBuf {
    let mut found: Option<PathBuf> = None;
    let entries = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("error finding {extension} file in {}: {e}", dir.display()));
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.extension().map(|e| e == extension).unwrap_or(false) {
            if found.is_some() {
                panic!("multiple {extension} files in {}", dir.display());
            }
            found = Some(path);
        }
    }
    let path = found.unwrap_or_else(|| panic!("no {extension} file in {}", dir.display()));
    if std::fs::File::open(&path).is_err() {
        panic!("image file is not readable: {}", path.display());
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image_root(dirs: &[&str]) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        for dir in dirs {
            let path = root.path().join(dir);
            std::fs::create_dir(&path).unwrap();
            std::fs::write(path.join("DeveloperDiskImage.dmg"), b"image").unwrap();
            std::fs::write(path.join("DeveloperDiskImage.dmg.signature"), b"sig").unwrap();
        }
        root
    }

    #[test]
    fn exact_version_wins() {
        let root = image_root(&["5.1", "6.1 (1ACFS)", "6.1.1"]);
        let images = DevDiskImages::in_directory(root.path());
        let found = images.find_for_version("6.1.1");
        assert_eq!(found.image.parent().unwrap(), root.path().join("6.1.1"));
        assert!(found.signature.ends_with("DeveloperDiskImage.dmg.signature"));
    }

    #[test]
    fn longest_common_prefix_wins_with_ties_broken_by_order() {
        let root = image_root(&["5.1", "6.1 (1ACFS)", "6.1.1"]);
        let images = DevDiskImages::in_directory(root.path());
        let found = images.find_for_version("6.1.2");
        assert_eq!(
            found.image.parent().unwrap(),
            root.path().join("6.1 (1ACFS)")
        );
    }

    #[test]
    #[should_panic(expected = "no disk image directory found")]
    fn major_minor_must_match() {
        let root = image_root(&["5.1", "6.1 (1ACFS)", "6.1.1"]);
        DevDiskImages::in_directory(root.path()).find_for_version("7.0.0");
    }

    #[test]
    #[should_panic(expected = "invalid product version string")]
    fn version_without_dotted_components_is_rejected() {
        let root = image_root(&["5.1"]);
        DevDiskImages::in_directory(root.path()).find_for_version("banana");
    }

    #[test]
    #[should_panic(expected = "no dmg file in")]
    fn directory_without_an_image_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("9.3");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("DeveloperDiskImage.dmg.signature"), b"sig").unwrap();
        DevDiskImages::in_directory(root.path()).find_for_version("9.3");
    }

    #[test]
    #[should_panic(expected = "multiple dmg files in")]
    fn directory_with_two_images_is_fatal() {
        let root = image_root(&["8.2"]);
        std::fs::write(root.path().join("8.2").join("Second.dmg"), b"image").unwrap();
        DevDiskImages::in_directory(root.path()).find_for_version("8.2");
    }

    #[test]
    fn non_version_directories_are_ignored() {
        let root = image_root(&["8.0", "Latest", "8.0 (12A365)"]);
        let images = DevDiskImages::in_directory(root.path());
        let found = images.find_for_version("8.0.2");
        assert_eq!(found.image.parent().unwrap(), root.path().join("8.0"));
    }
}
