//! On-disk formats: sequence metadata, annotation records, images, and
//! pickled artifacts.

pub mod egohumans;
pub mod image;
pub mod layout;
pub mod numeric;
pub mod pickle;

pub use egohumans::{
    BboxRecord, CameraParameters, HumanBodyParams, Pose2dRecord, SequenceAnnotation,
    WorldAnnotation, load_sequence_annotation,
};
pub use image::{WorkingImage, load_working_image};
pub use layout::image_path_for_pose2d;
pub use numeric::NumericArray;
