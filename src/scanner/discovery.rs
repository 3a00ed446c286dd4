use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every image file under `directory`, sorted by path.
///
/// Extensions are matched case-insensitively and symlinks are not followed.
/// Entries that cannot be read are skipped; only an unreadable root is an error.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    std::fs::metadata(directory)
        .with_context(|| format!("Cannot read folder {}", directory.display()))?;

    let extensions: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
    let mut images = Vec::new();

    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if extensions.iter().any(|e| *e == ext_lower) {
                images.push(path.to_path_buf());
            }
        }
    }

    // Sort by path for consistent ordering
    images.sort();

    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn default_extensions() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.png")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let images = discover_images(dir.path(), &default_extensions()).unwrap();

        assert_eq!(
            images,
            vec![
                dir.path().join("photo1.jpg"),
                dir.path().join("photo2.png"),
                dir.path().join("subdir/photo3.jpeg"),
            ]
        );
    }

    #[test]
    fn test_extension_match_ignores_case() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("LOUD.JPG")).unwrap();
        File::create(dir.path().join("Mixed.JpEg")).unwrap();
        File::create(dir.path().join("noext")).unwrap();

        let images = discover_images(dir.path(), &["JPG".to_string(), "jpeg".to_string()]).unwrap();
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn test_directory_named_like_image_is_skipped() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("album.jpg")).unwrap();
        File::create(dir.path().join("album.jpg/inside.png")).unwrap();

        let images = discover_images(dir.path(), &default_extensions()).unwrap();
        assert_eq!(images, vec![dir.path().join("album.jpg/inside.png")]);
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(discover_images(&dir.path().join("nope"), &default_extensions()).is_err());
    }
}
