//! PES (Packetized Elementary Stream) header parsing.

use crate::packet::parse_timestamp;
use crate::{read_bitfield, ErrorKind, Result, SliceReader};
use modular_bitfield_msb::prelude::*;

const PES_START_CODE_PREFIX: u32 = 0x000001;

/// Fixed 6-byte prefix shared by every PES packet.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// Flag byte pair that precedes the conditional fields, when present.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// A parsed PES header: the optional fields present (if any), presentation/decode timestamps,
/// and where the elementary payload begins within the packet.
#[derive(Debug, Copy, Clone)]
pub struct PesPacket {
    pub stream_id: u8,
    pub packet_length: u16,
    pub optional_header: Option<PesOptionalHeader>,
    /// 33-bit presentation timestamp at 90kHz, or `0` if not present.
    pub pts: i64,
    /// 33-bit decode timestamp at 90kHz. Equal to `pts` when DTS is absent.
    pub dts: i64,
    /// Offset from the start of the PES packet where the elementary payload begins.
    pub payload_offset: usize,
}

/// Parse a PES header from the start of `reader`. `reader` must be positioned at the first byte
/// of the PES packet (the `00 00 01` start code).
pub fn parse_pes_header(reader: &mut SliceReader) -> Result<PesPacket> {
    let header = read_bitfield!(reader, PesHeader);
    if header.start_code() != PES_START_CODE_PREFIX {
        return Err(reader.make_error(ErrorKind::InvalidPesStartCode));
    }
    let packet_length = header.packet_length();

    let optional_header = read_bitfield!(reader, PesOptionalHeader);
    let additional_length = optional_header.additional_header_length() as usize;
    let mut o_reader = reader.new_sub_reader(additional_length)?;

    let mut pts: i64 = 0;
    let mut dts: i64 = 0;
    if optional_header.has_pts() {
        if o_reader.remaining_len() < 5 {
            return Err(o_reader.make_error(ErrorKind::MalformedSection));
        }
        pts = parse_timestamp(o_reader.read_array_ref::<5>()?) as i64;
        dts = pts;
    }
    if optional_header.has_dts() {
        if o_reader.remaining_len() < 5 {
            return Err(o_reader.make_error(ErrorKind::MalformedSection));
        }
        dts = parse_timestamp(o_reader.read_array_ref::<5>()?) as i64;
    }
    // ESCR, ES_rate, DSM trick mode, additional copy info, and CRC fields are skipped: they are
    // consumed implicitly when `o_reader` is dropped, since only `payload_offset` below is used
    // to locate the payload. PES_extension_flag's branch is intentionally empty; the extension
    // region is opaque within `additional_length`.

    Ok(PesPacket {
        stream_id: header.stream_id(),
        packet_length,
        optional_header: Some(optional_header),
        pts,
        dts,
        payload_offset: 9 + additional_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts_bytes(prefix_nibble: u8, value: u64) -> [u8; 5] {
        let mut b = [0u8; 5];
        b[0] = (prefix_nibble << 4) | (((value >> 29) & 0x0E) as u8) | 0x01;
        b[1] = ((value >> 22) & 0xFF) as u8;
        b[2] = (((value >> 14) & 0xFE) as u8) | 0x01;
        b[3] = ((value >> 7) & 0xFF) as u8;
        b[4] = (((value << 1) & 0xFE) as u8) | 0x01;
        b
    }

    #[test]
    fn parses_pts_and_dts() {
        let pts_val: u64 = 9000;
        let dts_val: u64 = 9000;
        let mut wire = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00];
        wire.push(0b1000_0000); // marker bits, flags
        wire.push(0b1100_0000); // has_pts + has_dts
        wire.push(10); // additional_header_length
        wire.extend_from_slice(&pts_bytes(0b0011, pts_val));
        wire.extend_from_slice(&pts_bytes(0b0001, dts_val));
        wire.push(0xFF);

        let mut reader = SliceReader::new(&wire);
        let pes = parse_pes_header(&mut reader).unwrap();
        assert_eq!(pes.pts, pts_val as i64);
        assert_eq!(pes.dts, dts_val as i64);
        assert_eq!(pes.payload_offset, 9 + 10);
    }

    #[test]
    fn rejects_bad_start_code() {
        let wire = [0x00, 0x00, 0x02, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        let mut reader = SliceReader::new(&wire);
        assert!(matches!(
            parse_pes_header(&mut reader),
            Err(e) if matches!(e.kind, ErrorKind::InvalidPesStartCode)
        ));
    }

    #[test]
    fn max_33_bit_pts_round_trips_through_the_64_bit_field() {
        let pts_val: u64 = (1 << 33) - 1;
        let mut wire = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00];
        wire.push(0b1000_0000);
        wire.push(0b1000_0000); // has_pts only
        wire.push(5);
        wire.extend_from_slice(&pts_bytes(0b0010, pts_val));

        let mut reader = SliceReader::new(&wire);
        let pes = parse_pes_header(&mut reader).unwrap();
        assert_eq!(pes.pts, pts_val as i64);
        assert_eq!(pes.dts, pts_val as i64);
    }
}
