//! Output container for chunk files.

pub mod mpegts;

pub use mpegts::TsWriter;
