//! Splicing an encoded script into the MicroPython firmware template.
//!
//! The firmware `.hex` shipped with the editor contains a run of 43 colons
//! where the script records belong. Patching replaces that run verbatim.

use crate::codec;
use crate::error::{Error, Result};
use crate::image::hex::HexEncoder;
use log::{debug, info};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Placeholder marking the script insertion point in the firmware template.
pub const PLACEHOLDER_MARKER: &str = ":::::::::::::::::::::::::::::::::::::::::::";

/// File extension of the produced image.
pub const HEX_EXTENSION: &str = "hex";

/// Count occurrences of the marker, including overlapping ones.
fn marker_positions(template: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut from = 0;
    while let Some(pos) = template
        .get(from..)
        .and_then(|rest| rest.find(PLACEHOLDER_MARKER))
    {
        positions.push(from + pos);
        from += pos + 1;
    }
    positions
}

/// Replace the single placeholder in `template` with `encoded_hex`.
///
/// Fails with [`Error::MarkerNotFound`] when the marker is absent and
/// [`Error::MarkerAmbiguous`] when it occurs more than once.
pub fn patch(template: &str, encoded_hex: &str) -> Result<String> {
    let positions = marker_positions(template);
    let start = match positions.as_slice() {
        [] => return Err(Error::MarkerNotFound),
        [start] => *start,
        many => {
            return Err(Error::MarkerAmbiguous {
                count: many.len(),
            });
        },
    };
    let end = start + PLACEHOLDER_MARKER.len();

    let mut image =
        String::with_capacity(template.len() - PLACEHOLDER_MARKER.len() + encoded_hex.len());
    image.push_str(&template[..start]);
    image.push_str(encoded_hex);
    image.push_str(&template[end..]);
    Ok(image)
}

/// Encode `script` and splice it into `template`.
pub fn build_image(template: &str, script: &str, encoder: &HexEncoder) -> Result<String> {
    let bytes = codec::to_bytes(script)?;
    let encoded = encoder.encode(&bytes)?;
    let image = patch(template, &encoded)?;
    debug!(
        "Built firmware image: {} bytes template, {} bytes script block",
        template.len(),
        encoded.len()
    );
    Ok(image)
}

/// Path of the `.hex` artifact for `script_name` inside `dir`.
pub fn hex_file_path(dir: &Path, script_name: &str) -> PathBuf {
    dir.join(format!("{script_name}.{HEX_EXTENSION}"))
}

/// Write `image` to `<dir>/<script_name>.hex`.
///
/// The content goes to a temporary file in `dir` first and is renamed into
/// place, so a failed write never leaves a truncated image behind.
pub fn write_hex_file(dir: &Path, script_name: &str, image: &str) -> Result<PathBuf> {
    let path = hex_file_path(dir, script_name);
    let write_failed = |source| Error::WriteFailed {
        path: path.clone(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_failed)?;
    tmp.write_all(image.as_bytes())
        .map_err(write_failed)?;
    tmp.as_file()
        .sync_all()
        .map_err(write_failed)?;
    tmp.persist(&path)
        .map_err(|e| write_failed(e.error))?;

    info!("Wrote {} bytes to {}", image.len(), path.display());
    Ok(path)
}

/// Read a firmware template from disk.
pub fn load_template(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::hex::HexEncoderConfig;

    fn template() -> String {
        format!(":020000040000FA\n:0400000001020304F2\n{PLACEHOLDER_MARKER}\n:00000001FF\n")
    }

    #[test]
    fn test_marker_is_43_colons() {
        assert_eq!(PLACEHOLDER_MARKER.len(), 43);
        assert!(PLACEHOLDER_MARKER.chars().all(|c| c == ':'));
    }

    #[test]
    fn test_patch_length_law_and_untouched_context() {
        let template = template();
        let hex = ":10E000004D50000000000000000000000000000073";
        let start = template.find(PLACEHOLDER_MARKER).unwrap();

        let image = patch(&template, hex).unwrap();
        assert_eq!(
            image.len(),
            template.len() - PLACEHOLDER_MARKER.len() + hex.len()
        );
        assert_eq!(&image[..start], &template[..start]);
        assert_eq!(&image[start..start + hex.len()], hex);
        assert_eq!(
            &image[start + hex.len()..],
            &template[start + PLACEHOLDER_MARKER.len()..]
        );
        assert!(!image.contains(PLACEHOLDER_MARKER));
    }

    #[test]
    fn test_patch_missing_marker() {
        let err = patch(":00000001FF\n", "x").unwrap_err();
        assert!(matches!(err, Error::MarkerNotFound));
    }

    #[test]
    fn test_patch_duplicate_marker() {
        let template = format!("{PLACEHOLDER_MARKER}\n{PLACEHOLDER_MARKER}\n");
        let err = patch(&template, "x").unwrap_err();
        assert!(matches!(err, Error::MarkerAmbiguous { count: 2 }));
    }

    #[test]
    fn test_patch_overlapping_marker_run_is_ambiguous() {
        let template = format!("{PLACEHOLDER_MARKER}:");
        assert!(matches!(
            patch(&template, "x"),
            Err(Error::MarkerAmbiguous { count: 2 })
        ));
    }

    #[test]
    fn test_patch_does_not_mutate_template() {
        let template = template();
        let copy = template.clone();
        let _ = patch(&template, "abc").unwrap();
        assert_eq!(template, copy);
    }

    #[test]
    fn test_build_image_embeds_decodable_script() {
        let encoder = HexEncoder::new(HexEncoderConfig::default());
        let image = build_image(&template(), "display.scroll('hi')", &encoder).unwrap();
        assert_eq!(encoder.decode(&image).unwrap(), b"display.scroll('hi')");
    }

    #[test]
    fn test_build_image_rejects_wide_characters() {
        let encoder = HexEncoder::default();
        assert!(matches!(
            build_image(&template(), "print('\u{2603}')", &encoder),
            Err(Error::CodePointOutOfRange { .. })
        ));
    }

    #[test]
    fn test_build_image_rejects_oversized_script() {
        let encoder = HexEncoder::default();
        let script = "#".repeat(9000);
        assert!(matches!(
            build_image(&template(), &script, &encoder),
            Err(Error::EncodingLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_write_hex_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hex_file(dir.path(), "micropython_script", "content").unwrap();
        assert_eq!(path, dir.path().join("micropython_script.hex"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "content");

        // overwrite in place
        write_hex_file(dir.path(), "micropython_script", "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_write_hex_file_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-mounted");
        let err = write_hex_file(&missing, "script", "content").unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
        assert!(!missing.join("script.hex").exists());
    }
}
