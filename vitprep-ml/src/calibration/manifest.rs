//! The calibration input list consumed by the quantization toolchain.

use crate::error::PrepError;
use std::path::{Path, PathBuf};
use vitprep_core::persistence::atomic_write;

/// Render one `<input_name>:=<absolute path>` line per raw file.
pub fn render_manifest(input_name: &str, raw_paths: &[PathBuf]) -> Result<String, PrepError> {
    let mut out = String::new();
    for path in raw_paths {
        let absolute = std::path::absolute(path)?;
        out.push_str(input_name);
        out.push_str(":=");
        out.push_str(&absolute.to_string_lossy());
        out.push('\n');
    }
    Ok(out)
}

/// Write the manifest, replacing any previous one.
pub fn write_manifest(
    path: &Path,
    input_name: &str,
    raw_paths: &[PathBuf],
) -> Result<(), PrepError> {
    let content = render_manifest(input_name, raw_paths)?;
    atomic_write(path, content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_lines_are_absolute_and_ordered() {
        let dir = TempDir::new().unwrap();
        let paths = vec![dir.path().join("calib_3.raw"), dir.path().join("calib_0.raw")];
        let text = render_manifest("pixel_values", &paths).unwrap();
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(
            lines,
            vec![
                format!("pixel_values:={}", dir.path().join("calib_3.raw").display()),
                format!("pixel_values:={}", dir.path().join("calib_0.raw").display()),
            ]
        );
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_relative_paths_become_absolute() {
        let text = render_manifest("pixel_values", &[PathBuf::from("calibration_data/calib_0.raw")])
            .unwrap();
        let path = text.trim_end().strip_prefix("pixel_values:=").unwrap();
        assert!(Path::new(path).is_absolute());
        assert!(path.ends_with("calib_0.raw"));
    }

    #[test]
    fn test_empty_manifest_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input_list.txt");
        std::fs::write(&path, "pixel_values:=/stale\n").unwrap();
        write_manifest(&path, "pixel_values", &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
