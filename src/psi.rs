//! PSI (Program Specific Information) section header, PAT, PMT, and cross-packet section
//! reassembly.

use crate::{read_bitfield, ErrorKind, Result, SliceReader};
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

/// Fixed 3-byte PSI section header shared by PAT and PMT sections.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

/// Table-syntax fields that follow [`PsiHeader`] in any section with
/// `section_syntax_indicator = 1`.
#[bitfield]
#[derive(Debug, Copy, Clone)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

const PAT_TABLE_ID: u8 = 0x00;
const PMT_TABLE_ID: u8 = 0x02;
const CRC_LEN: usize = 4;

/// A tag+length+data descriptor found in a PAT/PMT descriptor loop.
///
/// Descriptors are parsed structurally (tag, length, raw bytes) but not interpreted; no
/// particular descriptor's payload is decoded further.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    fn parse(reader: &mut SliceReader) -> Result<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }
}

fn parse_descriptor_loop(reader: &mut SliceReader) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    while reader.remaining_len() > 0 {
        descriptors.push(Descriptor::parse(reader)?);
    }
    Ok(descriptors)
}

/// One program entry from a Program Association Section.
#[derive(Debug, Copy, Clone)]
pub struct PatProgram {
    /// Program number. `0` designates the Network PID entry rather than a real program.
    pub program_number: u16,
    /// PMT PID if `program_number != 0`, else the Network PID.
    pub program_map_pid: u16,
}

/// Parsed Program Association Table.
#[derive(Debug, Clone)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version_number: u8,
    pub programs: Vec<PatProgram>,
}

impl Pat {
    /// PMT PID for a given non-zero program number, if listed.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number == program_number && program_number != 0)
            .map(|p| p.program_map_pid)
    }

    /// The Network PID (the `program_number = 0` entry), if present.
    pub fn network_pid(&self) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number == 0)
            .map(|p| p.program_map_pid)
    }
}

/// Parse a PAT section body (everything following the 3-byte [`PsiHeader`], including the
/// trailing CRC-32, which is skipped but not verified).
pub fn parse_pat(header: &PsiHeader, body: &[u8]) -> Result<Pat> {
    if header.table_id() != PAT_TABLE_ID {
        return Err(section_error(body));
    }
    let mut reader = SliceReader::new(body);
    if reader.remaining_len() < 5 + CRC_LEN {
        return Err(reader.make_error(ErrorKind::MalformedSection));
    }
    let syntax = read_bitfield!(reader, PsiTableSyntax);

    let programs_len = reader.remaining_len().saturating_sub(CRC_LEN);
    let mut prog_reader = reader.new_sub_reader(programs_len)?;
    let mut programs = Vec::with_capacity(prog_reader.remaining_len() / 4);
    while prog_reader.remaining_len() >= 4 {
        let entry = prog_reader.read_array_ref::<4>()?;
        let program_number = u16::from_be_bytes([entry[0], entry[1]]);
        let pid = (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16;
        programs.push(PatProgram {
            program_number,
            program_map_pid: pid,
        });
    }
    // Trailing CRC-32 follows `programs_len`; read but not verified.
    let _crc = reader.read_be_u32()?;

    Ok(Pat {
        transport_stream_id: syntax.table_id_extension(),
        version_number: syntax.version(),
        programs,
    })
}

/// One elementary stream entry from a Program Map Section.
#[derive(Debug, Clone)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub es_descriptors: Vec<Descriptor>,
}

/// Parsed Program Map Table for one program.
#[derive(Debug, Clone)]
pub struct Pmt {
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub streams: Vec<PmtStream>,
}

/// Parse a PMT section body (everything following the 3-byte [`PsiHeader`], including the
/// trailing CRC-32, which is skipped but not verified).
pub fn parse_pmt(header: &PsiHeader, body: &[u8]) -> Result<Pmt> {
    if header.table_id() != PMT_TABLE_ID {
        return Err(section_error(body));
    }
    let mut reader = SliceReader::new(body);
    if reader.remaining_len() < 9 + CRC_LEN {
        return Err(reader.make_error(ErrorKind::MalformedSection));
    }
    let syntax = read_bitfield!(reader, PsiTableSyntax);

    let pcr_pid_bytes = reader.read_array_ref::<2>()?;
    let pcr_pid = (((pcr_pid_bytes[0] & 0x1F) as u16) << 8) | pcr_pid_bytes[1] as u16;
    let program_info_len_bytes = reader.read_array_ref::<2>()?;
    let program_info_length =
        (((program_info_len_bytes[0] & 0x0F) as u16) << 8) | program_info_len_bytes[1] as u16;

    let mut info_reader = reader.new_sub_reader(program_info_length as usize)?;
    let program_descriptors = parse_descriptor_loop(&mut info_reader)?;

    let streams_len = reader.remaining_len().saturating_sub(CRC_LEN);
    let mut streams_reader = reader.new_sub_reader(streams_len)?;
    let mut streams = Vec::new();
    while streams_reader.remaining_len() >= 5 {
        let es_header = streams_reader.read_array_ref::<5>()?;
        let stream_type = es_header[0];
        let elementary_pid = (((es_header[1] & 0x1F) as u16) << 8) | es_header[2] as u16;
        let es_info_length = (((es_header[3] & 0x0F) as u16) << 8) | es_header[4] as u16;

        if es_info_length as usize > streams_reader.remaining_len() {
            return Err(streams_reader.make_error(ErrorKind::MalformedSection));
        }
        let mut es_reader = streams_reader.new_sub_reader(es_info_length as usize)?;
        let es_descriptors = parse_descriptor_loop(&mut es_reader)?;

        streams.push(PmtStream {
            stream_type,
            elementary_pid,
            es_descriptors,
        });
    }

    let _crc = reader.read_be_u32()?;

    Ok(Pmt {
        program_number: syntax.table_id_extension(),
        version_number: syntax.version(),
        pcr_pid,
        program_descriptors,
        streams,
    })
}

fn section_error(body: &[u8]) -> crate::Error {
    SliceReader::new(body).make_error(ErrorKind::MalformedSection)
}

/// Accumulates a PSI section's bytes across one or more TS packets on a single PID.
///
/// Bounded by `section_length`, known from the first packet's header, so this is a simple
/// length-countdown builder rather than the open-ended accumulation a PES access unit needs.
pub(crate) struct PsiSectionBuilder {
    header: PsiHeader,
    body: Vec<u8>,
    remaining: usize,
}

impl PsiSectionBuilder {
    /// Begin a new section from a reader positioned immediately after the pointer field (and its
    /// filler bytes) on a PUSI=1 packet.
    pub fn start(reader: &mut SliceReader) -> Result<Self> {
        if reader.remaining_len() < 3 {
            return Err(reader.make_error(ErrorKind::MalformedSection));
        }
        let header_bytes = reader.read_array_ref::<3>()?;
        let header = PsiHeader::from_bytes(*header_bytes);
        let body_len = header.section_length() as usize;
        Ok(Self {
            header,
            body: Vec::with_capacity(body_len),
            remaining: body_len,
        })
    }

    /// Feed as much of `reader`'s remaining bytes as belong to this section. Returns `true` once
    /// the section is complete.
    pub fn append(&mut self, reader: &mut SliceReader) -> Result<bool> {
        if reader.remaining_len() <= self.remaining {
            self.remaining -= reader.remaining_len();
            self.body.extend_from_slice(reader.read_to_end()?);
        } else {
            self.body.extend_from_slice(reader.read(self.remaining)?);
            self.remaining = 0;
        }
        Ok(self.remaining == 0)
    }

    pub fn header(&self) -> &PsiHeader {
        &self.header
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Skip the `pointer_field` (and the bytes it declares as filler) at the start of a PUSI=1 PSI
/// payload. Per spec this skips `1 + pointer_field` bytes total, correcting a known bug in the C
/// reference implementation that only skipped the pointer byte itself.
pub(crate) fn skip_pointer_field(reader: &mut SliceReader) -> Result<()> {
    if reader.remaining_len() < 1 {
        return Err(reader.make_error(ErrorKind::MalformedSection));
    }
    let pointer_field = reader.read_u8()?;
    reader.skip(pointer_field as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat_section(programs: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        // PsiTableSyntax: transport_stream_id=1, version=0, current_next=1, section/last=0
        body.extend_from_slice(&[0x00, 0x01, 0x01, 0x00, 0x00]);
        for &(program_number, pid) in programs {
            body.extend_from_slice(&program_number.to_be_bytes());
            body.extend_from_slice(&[0xE0 | ((pid >> 8) as u8 & 0x1F), (pid & 0xFF) as u8]);
        }
        body.extend_from_slice(&[0, 0, 0, 0]); // CRC placeholder, not verified
        let header = PsiHeader::new()
            .with_table_id(PAT_TABLE_ID)
            .with_section_syntax_indicator(true)
            .with_section_length(body.len() as u16);
        let mut wire = header.into_bytes().to_vec();
        wire.extend_from_slice(&body);
        wire
    }

    #[test]
    fn pat_maps_program_to_pmt_pid() {
        let wire = pat_section(&[(0, 0x0010), (1, 0x1000)]);
        let header = PsiHeader::from_bytes(wire[0..3].try_into().unwrap());
        let pat = parse_pat(&header, &wire[3..]).unwrap();
        assert_eq!(pat.version_number, 0);
        assert_eq!(pat.pmt_pid(1), Some(0x1000));
        assert_eq!(pat.network_pid(), Some(0x0010));
    }

    #[test]
    fn pmt_streams_are_routable() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x01, 0x01, 0x00, 0x00]); // syntax
        body.extend_from_slice(&[0xE0, 0x00]); // pcr_pid
        body.extend_from_slice(&[0x00, 0x00]); // program_info_length = 0
        body.extend_from_slice(&[0x1B, 0xE0 | 0x10, 0x11, 0x00, 0x00]); // H.264 @ 0x1011
        body.extend_from_slice(&[0, 0, 0, 0]); // CRC
        let header = PsiHeader::new()
            .with_table_id(PMT_TABLE_ID)
            .with_section_syntax_indicator(true)
            .with_section_length(body.len() as u16);
        let pmt = parse_pmt(&header, &body).unwrap();
        assert_eq!(pmt.streams.len(), 1);
        assert_eq!(pmt.streams[0].stream_type, 0x1B);
        assert_eq!(pmt.streams[0].elementary_pid, 0x1011);
    }

    #[test]
    fn section_builder_reassembles_across_packets() {
        let wire = pat_section(&[(1, 0x1000)]);
        let (first, rest) = wire.split_at(5);
        let mut reader = SliceReader::new(first);
        let mut builder = PsiSectionBuilder::start(&mut reader).unwrap();
        assert!(!builder.append(&mut reader).unwrap());

        let mut reader2 = SliceReader::new(rest);
        assert!(builder.append(&mut reader2).unwrap());
        let header = *builder.header();
        let parsed = parse_pat(&header, &builder.into_body()).unwrap();
        assert_eq!(parsed.pmt_pid(1), Some(0x1000));
    }
}
