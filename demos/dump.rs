//! Runnable demo of the demuxer: reads a `.ts` file and writes one output file per first-seen
//! codec, in the spirit of a quick dump tool. Not part of the library's contract.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{Read, Write};

use tsdemux::{AccessUnit, CodecTag, Demuxer};

const PACKET_SIZE: usize = 188;

fn extension_for(codec: CodecTag) -> &'static str {
    match codec {
        CodecTag::H264 => "h264",
        CodecTag::Hevc => "h265",
        CodecTag::AacAdts | CodecTag::AacLatm => "aac",
        CodecTag::Mpeg1Audio | CodecTag::Mpeg2Audio => "mp2",
        CodecTag::Mpeg1Video => "mpeg1video",
        CodecTag::Mpeg2Video => "mpeg2video",
        CodecTag::Opus => "opus",
        _ => "bin",
    }
}

/// Opens (once) and writes to one file per (PID, codec) pair, keyed by a map rather than the
/// per-branch static locals the reference tool used, so two PIDs carrying the same codec each
/// get their own file instead of colliding on first-seen-wins.
struct PerCodecWriter {
    files: HashMap<(u16, CodecTag), File>,
}

impl PerCodecWriter {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
        }
    }

    fn write(&mut self, unit: &AccessUnit) {
        let file = self.files.entry((unit.pid, unit.codec)).or_insert_with(|| {
            let name = format!(
                "pid{:#06x}-{}.{}",
                unit.pid,
                match unit.codec {
                    CodecTag::Unknown(n) => format!("unknown-{:#04x}", n),
                    other => format!("{:?}", other).to_lowercase(),
                },
                extension_for(unit.codec)
            );
            File::create(&name).unwrap_or_else(|e| panic!("unable to create {name}: {e}"))
        });
        file.write_all(&unit.payload)
            .expect("write error on elementary stream output");
    }
}

fn main() {
    pretty_env_logger::init();

    let file_path = env::args()
        .nth(1)
        .expect("usage: dump <input.ts>");

    let mut file = File::open(&file_path).expect("unable to open input file");
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .expect("unable to read input file");

    let mut demuxer = Demuxer::new();
    let mut writer = PerCodecWriter::new();
    let mut sink = |unit: AccessUnit| writer.write(&unit);

    let mut offset = 0;
    while offset + PACKET_SIZE <= data.len() {
        if data[offset] != 0x47 {
            offset += 1;
            continue;
        }
        if offset + PACKET_SIZE < data.len() && data[offset + PACKET_SIZE] != 0x47 {
            offset += 1;
            continue;
        }

        let mut packet = [0u8; PACKET_SIZE];
        packet.copy_from_slice(&data[offset..offset + PACKET_SIZE]);
        if let Err(e) = demuxer.feed(&packet, &mut sink) {
            eprintln!("parse error at offset {offset}: {e:?}");
        }
        offset += PACKET_SIZE;
    }
    demuxer.flush(&mut sink);
}
