//! In-order BAM record reassembly on top of the BGZF reader (spec §3/§4.I).

pub mod in_order_reader;

pub use in_order_reader::{BamDelegate, BamFlags, BamHeader, InOrderReader, Record, ReferenceSequence};
