pub mod assemble;
pub mod opf;
pub mod package;
pub mod segment;
pub mod xml;

pub use assemble::{assemble_bytes, assemble_file};
pub use package::EpubPackage;
pub use segment::{segment, SegmentOptions, SegmentedBook};
