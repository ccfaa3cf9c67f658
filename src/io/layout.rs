//! EgoHumans on-disk layout conventions.
//!
//! ```text
//! <root>/<big_seq>/<small_seq>/parsed_annot_hongsuk.pkl
//! .../processed_data/poses2d/<cam>/rgb/<frame>.npy   (2D pose annotation)
//! .../exo/<cam>/images/<frame>.jpg                    (raw image)
//! ```

use std::path::PathBuf;

/// Per-sequence metadata blob, relative to the small-sequence directory.
pub const SEQUENCE_ANNOTATION_FILE: &str = "parsed_annot_hongsuk.pkl";

/// Processed 2D pose namespace -> raw image namespace.
pub const POSE2D_TO_IMAGE_DIR: (&str, &str) = ("processed_data/poses2d", "exo");

/// Filename component rename.
pub const POSE2D_TO_IMAGE_COMPONENT: (&str, &str) = ("rgb", "images");

/// Numeric-array extension -> image extension.
pub const POSE2D_TO_IMAGE_EXTENSION: (&str, &str) = ("npy", "jpg");

/// Derives the raw image path for a 2D pose annotation path.
///
/// Applies the three substitutions in order, each to every occurrence, as
/// plain text replacement on the path string.
pub fn image_path_for_pose2d(pose2d_path: &str) -> PathBuf {
    let rules = [
        POSE2D_TO_IMAGE_DIR,
        POSE2D_TO_IMAGE_COMPONENT,
        POSE2D_TO_IMAGE_EXTENSION,
    ];
    let derived = rules
        .iter()
        .fold(pose2d_path.to_string(), |path, (from, to)| path.replace(from, to));
    PathBuf::from(derived)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path_derivation() {
        let pose2d = "/data/01_tagging/001_tagging/processed_data/poses2d/cam01/rgb/00010.npy";
        assert_eq!(
            image_path_for_pose2d(pose2d),
            PathBuf::from("/data/01_tagging/001_tagging/exo/cam01/images/00010.jpg")
        );
    }

    #[test]
    fn test_substitution_is_textual() {
        // Every occurrence is replaced, including inside other names.
        assert_eq!(
            image_path_for_pose2d("rgb_npy/processed_data/poses2d/x.npy"),
            PathBuf::from("images_jpg/exo/x.jpg")
        );
    }
}
