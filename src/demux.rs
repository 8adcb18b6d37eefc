//! Top-level demuxer state machine: PID routing, PSI table tracking, and per-elementary-PID
//! PES reassembly into access units.

use crate::codec::CodecTag;
use crate::packet::{self, TsPacketHeader, NULL_PID};
use crate::pes::parse_pes_header;
use crate::psi::{self, Pat, Pmt, PsiHeader, PsiSectionBuilder};
use crate::{Result, SliceReader};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};

const PAT_PID: u16 = 0x0000;
const SDT_PID: u16 = 0x0011;

/// One fully reassembled access unit, ready to hand to the consumer.
#[derive(Debug)]
pub struct AccessUnit {
    pub codec: CodecTag,
    pub pid: u16,
    pub pts: i64,
    pub dts: i64,
    pub payload: Vec<u8>,
}

/// Receives [`AccessUnit`] events as the demuxer reassembles them.
pub trait AccessUnitSink {
    /// Called once per completed (or flushed) access unit.
    fn on_access_unit(&mut self, unit: AccessUnit);
}

impl<F: FnMut(AccessUnit)> AccessUnitSink for F {
    fn on_access_unit(&mut self, unit: AccessUnit) {
        self(unit)
    }
}

struct PendingFrame {
    codec: CodecTag,
    pts: i64,
    dts: i64,
    payload: Vec<u8>,
}

/// Per-elementary-PID reassembly state, keyed by the stream's PMT entry.
struct StreamState {
    stream_type: u8,
    codec: CodecTag,
    last_continuity_counter: Option<u8>,
    have_pes_header: bool,
    pending: Option<PendingFrame>,
}

impl StreamState {
    fn new(stream_type: u8) -> Self {
        Self {
            stream_type,
            codec: CodecTag::from(stream_type),
            last_continuity_counter: None,
            have_pes_header: false,
            pending: None,
        }
    }

    fn take_pending(&mut self) -> Option<PendingFrame> {
        self.pending.take()
    }
}

/// Stateful MPEG-TS demultiplexer.
///
/// Feed it 188-byte packets in order via [`Demuxer::feed`]; it emits [`AccessUnit`] values
/// through the supplied sink as PES access units complete. Call [`Demuxer::flush`] at end of
/// input to emit any still-pending frames.
#[derive(Default)]
pub struct Demuxer {
    pat: Option<Pat>,
    pmts: HashMap<u16, Pmt>,
    pmt_pid_to_program: HashMap<u16, u16>,
    elementary_pid_to_pmt_pid: HashMap<u16, u16>,
    streams: HashMap<u16, StreamState>,
    pending_sections: HashMap<u16, PsiSectionBuilder>,
}

impl Demuxer {
    /// Construct an empty demuxer with no known PAT/PMT state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed exactly one 188-byte TS packet. Emits zero or more access units to `sink`.
    pub fn feed(&mut self, packet: &[u8; 188], sink: &mut impl AccessUnitSink) -> Result<()> {
        let mut reader = SliceReader::new(packet);
        let header = packet::parse_header(&mut reader)?;
        let pid = header.pid();

        if pid == NULL_PID {
            trace!("null packet");
            return Ok(());
        }

        if header.has_adaptation_field() {
            match packet::parse_adaptation_field(&mut reader) {
                Ok(af) => {
                    if af.pcr.is_some() {
                        trace!("PCR on PID {:#x}: {:?}", pid, af.pcr);
                    }
                }
                Err(e) => {
                    warn!("malformed adaptation field on PID {:#x}: {:?}", pid, e);
                    return Err(e);
                }
            }
        }

        if !header.has_payload() {
            return Ok(());
        }

        self.dispatch(pid, &header, &mut reader, sink)
    }

    fn dispatch(
        &mut self,
        pid: u16,
        header: &TsPacketHeader,
        reader: &mut SliceReader,
        sink: &mut impl AccessUnitSink,
    ) -> Result<()> {
        if pid == PAT_PID {
            return self.feed_psi(pid, header.pusi(), reader, Self::handle_pat);
        }
        if pid == SDT_PID {
            trace!("ignoring SDT packet");
            return Ok(());
        }
        if self.pmt_pid_to_program.contains_key(&pid) {
            return self.feed_psi(pid, header.pusi(), reader, Self::handle_pmt);
        }
        if self.elementary_pid_to_pmt_pid.contains_key(&pid) {
            return self.feed_pes(pid, header, reader, sink);
        }

        trace!("dropping packet on unrouted PID {:#x}", pid);
        Ok(())
    }

    fn feed_psi(
        &mut self,
        pid: u16,
        pusi: bool,
        reader: &mut SliceReader,
        handler: fn(&mut Self, u16, &PsiHeader, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if pusi {
            if self.pending_sections.remove(&pid).is_some() {
                debug!("discarding unfinished PSI section on PID {:#x}", pid);
            }
            psi::skip_pointer_field(reader)?;
            let mut builder = PsiSectionBuilder::start(reader)?;
            if builder.append(reader)? {
                let header = *builder.header();
                handler(self, pid, &header, &builder.into_body())?;
            } else {
                self.pending_sections.insert(pid, builder);
            }
        } else if let Some(mut builder) = self.pending_sections.remove(&pid) {
            if builder.append(reader)? {
                let header = *builder.header();
                handler(self, pid, &header, &builder.into_body())?;
            } else {
                self.pending_sections.insert(pid, builder);
            }
        } else {
            trace!("PSI continuation with no pending section on PID {:#x}", pid);
        }
        Ok(())
    }

    fn handle_pat(&mut self, _pid: u16, header: &PsiHeader, body: &[u8]) -> Result<()> {
        let pat = psi::parse_pat(header, body)?;

        if let Some(existing) = &self.pat {
            if existing.version_number == pat.version_number {
                return Ok(());
            }
        }

        let new_pmt_pids: HashSet<u16> = pat
            .programs
            .iter()
            .filter(|p| p.program_number != 0)
            .map(|p| p.program_map_pid)
            .collect();

        let stale_pmt_pids: Vec<u16> = self
            .pmt_pid_to_program
            .keys()
            .filter(|pmt_pid| !new_pmt_pids.contains(pmt_pid))
            .copied()
            .collect();
        for stale in stale_pmt_pids {
            self.pmt_pid_to_program.remove(&stale);
            self.remove_pmt(stale);
        }

        for program in pat.programs.iter().filter(|p| p.program_number != 0) {
            self.pmt_pid_to_program
                .entry(program.program_map_pid)
                .or_insert(program.program_number);
        }

        debug!(
            "accepted PAT version {} with {} program(s)",
            pat.version_number,
            pat.programs.len()
        );
        self.pat = Some(pat);
        Ok(())
    }

    fn remove_pmt(&mut self, pmt_pid: u16) {
        self.pending_sections.remove(&pmt_pid);
        if let Some(pmt) = self.pmts.remove(&pmt_pid) {
            for stream in &pmt.streams {
                self.elementary_pid_to_pmt_pid.remove(&stream.elementary_pid);
                self.streams.remove(&stream.elementary_pid);
            }
        }
    }

    fn handle_pmt(&mut self, pid: u16, header: &PsiHeader, body: &[u8]) -> Result<()> {
        let pmt = psi::parse_pmt(header, body)?;

        if let Some(existing) = self.pmts.get(&pid) {
            if existing.version_number == pmt.version_number {
                return Ok(());
            }
        }

        let new_pids: HashSet<u16> = pmt.streams.iter().map(|s| s.elementary_pid).collect();
        let stale_pids: Vec<u16> = self
            .elementary_pid_to_pmt_pid
            .iter()
            .filter(|(_, &owner)| owner == pid)
            .filter(|(epid, _)| !new_pids.contains(epid))
            .map(|(&epid, _)| epid)
            .collect();
        for epid in stale_pids {
            self.elementary_pid_to_pmt_pid.remove(&epid);
            self.streams.remove(&epid);
        }

        for stream in &pmt.streams {
            self.elementary_pid_to_pmt_pid
                .insert(stream.elementary_pid, pid);

            match self.streams.get(&stream.elementary_pid) {
                Some(existing) if existing.stream_type == stream.stream_type => {
                    trace!(
                        "PMT update, stream_type unchanged on PID {:#x}",
                        stream.elementary_pid
                    );
                }
                _ => {
                    debug!(
                        "routing PID {:#x} as stream_type {:#x}",
                        stream.elementary_pid, stream.stream_type
                    );
                    self.streams
                        .insert(stream.elementary_pid, StreamState::new(stream.stream_type));
                }
            }
        }

        debug!(
            "accepted PMT version {} for program {} with {} stream(s)",
            pmt.version_number,
            pmt.program_number,
            pmt.streams.len()
        );
        self.pmts.insert(pid, pmt);
        Ok(())
    }

    fn feed_pes(
        &mut self,
        pid: u16,
        header: &TsPacketHeader,
        reader: &mut SliceReader,
        sink: &mut impl AccessUnitSink,
    ) -> Result<()> {
        if header.pusi() {
            self.feed_pes_start(pid, header, reader, sink)
        } else {
            self.feed_pes_continuation(pid, header, reader)
        }
    }

    fn feed_pes_start(
        &mut self,
        pid: u16,
        header: &TsPacketHeader,
        reader: &mut SliceReader,
        sink: &mut impl AccessUnitSink,
    ) -> Result<()> {
        let pes = match parse_pes_header(reader) {
            Ok(pes) => pes,
            Err(e) => {
                warn!("invalid PES start code on PID {:#x}: {:?}", pid, e);
                if let Some(state) = self.streams.get_mut(&pid) {
                    state.pending = None;
                    state.have_pes_header = false;
                }
                return Ok(());
            }
        };

        let state = self
            .streams
            .get_mut(&pid)
            .expect("feed_pes_start only called for routed PIDs");

        if let Some(pending) = &state.pending {
            if pending.dts != pes.dts {
                let finished = state.take_pending();
                Self::emit(sink, pid, finished);
            }
        }

        if state.pending.is_none() {
            state.pending = Some(PendingFrame {
                codec: state.codec,
                pts: pes.pts,
                dts: pes.dts,
                payload: Vec::new(),
            });
        }

        state.have_pes_header = true;
        state.last_continuity_counter = Some(header.continuity_counter());

        // `reader` is already positioned at the elementary payload: parse_pes_header consumes
        // exactly `payload_offset` bytes via its own sub-reader for the optional fields.
        let payload = reader.read_to_end()?;
        state
            .pending
            .as_mut()
            .expect("just set above")
            .payload
            .extend_from_slice(payload);

        Ok(())
    }

    fn feed_pes_continuation(
        &mut self,
        pid: u16,
        header: &TsPacketHeader,
        reader: &mut SliceReader,
    ) -> Result<()> {
        let state = self
            .streams
            .get_mut(&pid)
            .expect("feed_pes_continuation only called for routed PIDs");

        if !state.have_pes_header {
            trace!("dropping mid-stream packet on PID {:#x}", pid);
            return Ok(());
        }

        let expected = state.last_continuity_counter.map(|cc| (cc + 1) % 16);
        let actual = header.continuity_counter();
        if let Some(expected) = expected {
            if expected != actual {
                warn!(
                    "continuity loss on PID {:#x}: expected {}, got {}",
                    pid, expected, actual
                );
            }
        }
        state.last_continuity_counter = Some(actual);

        let payload = reader.read_to_end()?;
        if let Some(pending) = &mut state.pending {
            pending.payload.extend_from_slice(payload);
        }
        Ok(())
    }

    fn emit(sink: &mut impl AccessUnitSink, pid: u16, frame: Option<PendingFrame>) {
        if let Some(frame) = frame {
            if !frame.payload.is_empty() {
                sink.on_access_unit(AccessUnit {
                    codec: frame.codec,
                    pid,
                    pts: frame.pts,
                    dts: frame.dts,
                    payload: frame.payload,
                });
            }
        }
    }

    /// Emit any still-pending access unit for every tracked elementary stream, then clear it.
    pub fn flush(&mut self, sink: &mut impl AccessUnitSink) {
        let pids: Vec<u16> = self.streams.keys().copied().collect();
        for pid in pids {
            let frame = self
                .streams
                .get_mut(&pid)
                .and_then(StreamState::take_pending);
            Self::emit(sink, pid, frame);
        }
    }
}
