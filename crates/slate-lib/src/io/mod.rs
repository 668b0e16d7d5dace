pub mod container;
pub mod csv;
pub mod edf;
pub mod tabular;

pub use container::{read_recording, write_recording, ContainerKind, ContainerMeta};
pub use csv::load_matrix_recording;
pub use edf::load_edf_recording;
pub use tabular::{Column, Frame};
