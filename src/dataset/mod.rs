//! Dataset indexing, sample assembly and parallel loading.

pub mod assembler;
pub mod index;
pub mod loader;
pub mod sample;

pub use assembler::{AssemblerOptions, SampleAssembler};
pub use index::{CameraCatalog, CameraSet, DEFAULT_CAMERAS, DatasetIndex, IndexOptions, Split, select_cameras};
pub use loader::{LoadedSample, SampleLoader};
pub use sample::{CameraPaths, HumanAnnotation2d, SampleDescriptor, SampleRecord};
