use std::fs;
use std::io;
use std::path::Path;

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Size in bytes of a backup artifact. Directories are walked so striped
/// backups written into a folder are measured as a whole; anything that is
/// neither file nor directory is refused.
pub fn artifact_size<P: AsRef<Path>>(path: P) -> io::Result<u64> {
    let mut pending = vec![path.as_ref().to_path_buf()];
    let mut total = 0u64;
    while let Some(next) = pending.pop() {
        let metadata = fs::metadata(&next)?;
        if metadata.is_file() {
            total += metadata.len();
        } else if metadata.is_dir() {
            for entry in fs::read_dir(&next)? {
                pending.push(entry?.path());
            }
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file or directory", next.display()),
            ));
        }
    }
    Ok(total)
}

/// Human readable size, two decimals, binary multiples.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in &SIZE_UNITS[..SIZE_UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} {}", size, SIZE_UNITS[SIZE_UNITS.len() - 1])
}

/// Percentage of `used` over `total`, 0 when there is no capacity.
pub fn usage_percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_artifact_size_of_file_and_directory() {
        let dir = tempdir().unwrap();
        let mut first = fs::File::create(dir.path().join("a.bak")).unwrap();
        first.write_all(&[0u8; 100]).unwrap();

        let nested = dir.path().join("stripes");
        fs::create_dir(&nested).unwrap();
        let mut second = fs::File::create(nested.join("b.bak")).unwrap();
        second.write_all(&[0u8; 28]).unwrap();

        assert_eq!(artifact_size(dir.path().join("a.bak")).unwrap(), 100);
        assert_eq!(artifact_size(dir.path()).unwrap(), 128);
    }

    #[test]
    fn test_artifact_size_missing_path() {
        let dir = tempdir().unwrap();
        assert!(artifact_size(dir.path().join("missing.bak")).is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_size(2048 * 1024 * 1024 * 1024 * 1024), "2048.00 TB");
    }

    #[test]
    fn test_usage_percentage() {
        assert_eq!(usage_percentage(50, 200), 25.0);
        assert_eq!(usage_percentage(10, 0), 0.0);
    }
}
