//! MPEG-2 Transport Stream demultiplexer.
//!
//! Feeds 188-byte TS packets through [`Demuxer::feed`] and reassembles PAT/PMT tables and
//! per-elementary-PID PES access units, delivering each completed access unit to a caller-supplied
//! [`AccessUnitSink`].
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! tsdemux = "~0.1.0"
//! ```
//!
//! ```no_run
//! use tsdemux::{AccessUnit, Demuxer};
//! use std::fs::File;
//! use std::io::Read;
//!
//! let mut file = File::open("stream.ts").expect("unable to open");
//! let mut demuxer = Demuxer::new();
//! let mut packet = [0u8; 188];
//! let mut sink = |unit: AccessUnit| println!("{:?}", unit);
//! while file.read_exact(&mut packet).is_ok() {
//!     demuxer.feed(&packet, &mut sink).expect("parse error");
//! }
//! demuxer.flush(&mut sink);
//! ```

#![deny(missing_docs, unsafe_code)]
#![allow(clippy::new_without_default)]

use std::result;

mod slice_reader;
pub use slice_reader::SliceReader;

pub mod packet;
pub use packet::{
    AdaptationField, AdaptationFieldExtension, PcrTimestamp, SeamlessSplice, TransportScramblingControl,
    TsPacketHeader,
};

pub mod psi;
pub use psi::{Descriptor, Pat, PatProgram, Pmt, PmtStream, PsiHeader};

pub mod pes;
pub use pes::{PesOptionalHeader, PesPacket};

pub mod codec;
pub use codec::CodecTag;

pub mod demux;
pub use demux::{AccessUnit, AccessUnitSink, Demuxer};

/// The kind of recoverable condition a parse step encountered.
///
/// None of these are fatal to the demuxer: the offending packet or section is discarded and
/// reassembly continues. See the module-level documentation of [`Demuxer`] for how each kind is
/// handled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// A packet's first byte was not `0x47`.
    InvalidSync,
    /// A read extended past the bytes available; carries the requested length.
    TruncatedPacket(usize),
    /// An adaptation field's declared length or sub-field layout was inconsistent.
    MalformedAdaptation,
    /// A PSI section's declared length or fixed fields were inconsistent.
    MalformedSection,
    /// A PES header's first three bytes were not `00 00 01`.
    InvalidPesStartCode,
}

/// Error produced while parsing one packet, section, or header.
///
/// Mirrors the reference crate's own error shape: a byte offset paired with a kind, rather than a
/// richer structured error. Most call sites log this via the `log` crate instead of propagating
/// it; see [`ErrorKind`].
#[derive(Debug, Copy, Clone)]
pub struct Error {
    /// Byte offset within the slice being parsed where the error was encountered.
    pub location: usize,
    /// What went wrong.
    pub kind: ErrorKind,
}

/// [`std::result::Result`] alias using [`Error`].
pub type Result<T> = result::Result<T, Error>;
