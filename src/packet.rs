//! Link-layer TS packet header and adaptation field decoding.

use crate::{read_bitfield, ErrorKind, Result, SliceReader};
use modular_bitfield_msb::prelude::*;
use std::fmt::{Debug, Formatter};

/// Sync byte every well-formed TS packet must begin with.
pub const SYNC_BYTE: u8 = 0x47;

/// PID that carries no demuxable content ("null" packets, used for bitrate padding).
pub const NULL_PID: u16 = 0x1FFF;

/// TSC values used in a packet's header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Reserved; do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct TsPacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Flag byte that follows the adaptation field's length byte, present only when
/// `adaptation_field_length >= 1`. Specifies the particular type(s) of meta-data contained.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct AdaptationFieldFlags {
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

#[bitfield]
#[derive(Debug, Copy, Clone)]
struct AdaptationFieldExtensionHeader {
    length: B8,
    ltw_flag: bool,
    piecewise_rate_flag: bool,
    seamless_splice_flag: bool,
    #[skip]
    reserved: B5,
}

/// Expands to [`format_args`] for a 90kHz timestamp of any integer type.
///
/// Format is `<hours>:<minutes>:<seconds>:<90kHz-ticks>`.
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Program Clock Reference (PCR) for synchronizing the decoder with the encoder.
#[derive(Default, Copy, Clone)]
pub struct PcrTimestamp {
    /// 33 bits of a 90kHz base clock. May be formatted with [`pts_format_args`].
    pub base: u64,
    /// 9 bits of a 27MHz clock rolling over every 300 counts to the base.
    pub extension: u16,
}

impl PcrTimestamp {
    /// The full PCR value expressed in 27 MHz ticks (`base * 300 + extension`).
    pub fn ticks_27mhz(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }
}

impl Debug for PcrTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcrTimestamp")
            .field("base", &pts_format_args!(self.base))
            .field("extension", &self.extension)
            .finish()
    }
}

/// `seamless_splice` sub-field of the adaptation field extension; carries the DTS of the next
/// access unit across a splice point, in the same 33-bit layout as a PES PTS/DTS.
#[derive(Debug, Copy, Clone)]
pub struct SeamlessSplice {
    pub splice_type: u8,
    pub dts_next_au: u64,
}

/// Adaptation field extension (LTW / piecewise rate / seamless splice sub-fields).
#[derive(Debug, Default, Copy, Clone)]
pub struct AdaptationFieldExtension {
    pub ltw_offset: Option<u16>,
    pub piecewise_rate: Option<u32>,
    pub seamless_splice: Option<SeamlessSplice>,
}

/// Non-payload packet metadata.
#[derive(Debug, Default)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub pcr: Option<PcrTimestamp>,
    pub opcr: Option<PcrTimestamp>,
    pub splice_countdown: Option<i8>,
    pub transport_private_data: Vec<u8>,
    pub extension: Option<AdaptationFieldExtension>,
}

fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

/// Parse a PES/adaptation-extension style 33-bit timestamp (5-byte layout shared by PTS, DTS,
/// and `DTS_next_AU`).
pub(crate) fn parse_timestamp(b: &[u8; 5]) -> u64 {
    let mut ts: u64 = ((b[0] & 0x0E) as u64) << 29;
    ts |= (b[1] as u64) << 22;
    ts |= ((b[2] & 0xFE) as u64) << 14;
    ts |= (b[3] as u64) << 7;
    ts |= ((b[4] & 0xFE) as u64) >> 1;
    ts
}

/// Parse the TS packet header (first 4 bytes) and validate the sync byte.
pub fn parse_header(reader: &mut SliceReader) -> Result<TsPacketHeader> {
    let header = read_bitfield!(reader, TsPacketHeader);
    if header.sync_byte() != SYNC_BYTE {
        return Err(reader.make_error(ErrorKind::InvalidSync));
    }
    Ok(header)
}

/// Parse an adaptation field, bounds-checked against the enclosing packet.
///
/// `adaptation_field_length == 0` is legal and means the adaptation field is the length byte
/// alone, with no flags byte following it; the flags byte (and everything after it) is only
/// present once `adaptation_field_length >= 1`.
pub fn parse_adaptation_field(reader: &mut SliceReader) -> Result<AdaptationField> {
    let adaptation_field_length = reader.read_u8()? as usize;
    if adaptation_field_length == 0 {
        return Ok(AdaptationField::default());
    }
    if adaptation_field_length > 183 {
        return Err(reader.make_error(ErrorKind::MalformedAdaptation));
    }

    let header = read_bitfield!(reader, AdaptationFieldFlags);

    let mut a_reader = reader.new_sub_reader(adaptation_field_length - 1)?;
    let mut out = AdaptationField {
        discontinuity: header.discontinuity(),
        random_access: header.random_access(),
        priority: header.priority(),
        ..Default::default()
    };

    if header.has_pcr() {
        if a_reader.remaining_len() < 6 {
            return Err(a_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        out.pcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
    }
    if header.has_opcr() {
        if a_reader.remaining_len() < 6 {
            return Err(a_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        out.opcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
    }
    if header.has_splice_countdown() {
        if a_reader.remaining_len() < 1 {
            return Err(a_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        out.splice_countdown = Some(a_reader.read_u8()? as i8);
    }
    if header.has_transport_private_data() {
        if a_reader.remaining_len() < 1 {
            return Err(a_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        let length = a_reader.read_u8()? as usize;
        out.transport_private_data = a_reader.read(length)?.to_vec();
    }
    if header.has_adaptation_field_extension() {
        out.extension = Some(parse_extension(&mut a_reader)?);
    }
    // Remaining bytes, if any, are 0xFF stuffing and are ignored.

    Ok(out)
}

fn parse_extension(reader: &mut SliceReader) -> Result<AdaptationFieldExtension> {
    let ext_header = read_bitfield!(reader, AdaptationFieldExtensionHeader);
    let ext_length = ext_header.length() as usize;
    let mut ext_reader = reader.new_sub_reader(ext_length)?;

    let mut out = AdaptationFieldExtension::default();
    if ext_header.ltw_flag() {
        if ext_reader.remaining_len() < 2 {
            return Err(ext_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        let bytes = ext_reader.read_array_ref::<2>()?;
        out.ltw_offset = Some((((bytes[0] & 0x7F) as u16) << 8) | bytes[1] as u16);
    }
    if ext_header.piecewise_rate_flag() {
        if ext_reader.remaining_len() < 3 {
            return Err(ext_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        let bytes = ext_reader.read_array_ref::<3>()?;
        out.piecewise_rate = Some(
            (((bytes[0] & 0x3F) as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32,
        );
    }
    if ext_header.seamless_splice_flag() {
        if ext_reader.remaining_len() < 5 {
            return Err(ext_reader.make_error(ErrorKind::MalformedAdaptation));
        }
        let bytes = ext_reader.read_array_ref::<5>()?;
        out.seamless_splice = Some(SeamlessSplice {
            splice_type: (bytes[0] >> 4) & 0x0F,
            dts_next_au: parse_timestamp(bytes),
        });
    }
    // af_descriptor_not_present_flag reserved sub-field is not represented elsewhere.

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_adaptation_field_consumes_only_the_length_byte() {
        let mut wire = vec![0x00u8]; // adaptation_field_length = 0
        wire.extend_from_slice(b"PAYLOAD!"); // stand-in for the 183 bytes of payload that follow
        let mut reader = SliceReader::new(&wire);

        let af = parse_adaptation_field(&mut reader).unwrap();
        assert!(!af.discontinuity);
        assert!(af.pcr.is_none());
        assert_eq!(reader.read_to_end().unwrap(), b"PAYLOAD!");
    }

    #[test]
    fn full_length_adaptation_field_leaves_no_payload() {
        let mut wire = vec![183u8, 0x00]; // length, flags (no sub-fields set)
        wire.extend(std::iter::repeat(0xFFu8).take(182)); // stuffing fills out the field
        let mut reader = SliceReader::new(&wire);

        let af = parse_adaptation_field(&mut reader).unwrap();
        assert!(af.pcr.is_none());
        assert!(af.transport_private_data.is_empty());
        assert_eq!(reader.read_to_end().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn pcr_flag_parses_base_and_extension() {
        // base = 1, extension = 0: b[0..4] = 0, b[4] = 0x80 (base's LSB in bit 7), b[5] = 0
        let wire = [7u8, 0b0001_0000, 0x00, 0x00, 0x00, 0x80, 0x00];
        let mut reader = SliceReader::new(&wire);

        let af = parse_adaptation_field(&mut reader).unwrap();
        let pcr = af.pcr.expect("has_pcr bit was set");
        assert_eq!(pcr.base, 1);
        assert_eq!(pcr.extension, 0);
        assert!(af.opcr.is_none());
    }

    #[test]
    fn oversized_length_is_malformed() {
        let wire = [255u8];
        let mut reader = SliceReader::new(&wire);
        assert!(matches!(
            parse_adaptation_field(&mut reader),
            Err(e) if matches!(e.kind, ErrorKind::MalformedAdaptation)
        ));
    }
}
