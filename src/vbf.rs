/*! VBF (Vehicle Binary Format) firmware artifacts.

A VBF file is a text header followed by a binary chunk stream:

```text
vbf_version = 2.2;
header {
    description = { "Engine control module" };
    sw_part_number = "30668471 A";
    sw_part_type = SBL;
    network = CAN_HS;
    ecu_address = 0x7A;
    frame_format = CAN_STANDARD;
    call = 0x00018000;
    file_checksum = 0x79C74529;
    erase = { { 0x8000, 0x6000 }, { 0x10000, 0x70000 } };
}
```

Keys are case-insensitive, `// ...` comments and whitespace are ignored.
The body is a sequence of records: big-endian `write_offset`, big-endian
`size`, `size` data bytes, then a CRC trailer: 16 bits from version 2
on, 8 bits before. This module also rebuilds chunk layouts from raw BIN
dumps for the ECUs the flasher knows.
*/
use std::fmt::Write as _;

use log::debug;

use crate::checksum::{crc16, is_supported_image, update_image};
use crate::config::CarPlatform;
use crate::{Error, Result};

/// Software part kind from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwPartType {
    /// Not stated.
    #[default]
    Unknown,
    /// Secondary bootloader.
    Sbl,
    /// Calibration data.
    Data,
    /// Executable.
    Exe,
    /// Signature configuration.
    SigCfg,
}

/// Which bus the part is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkType {
    /// Not stated.
    #[default]
    Unknown,
    /// High-speed CAN.
    CanHs,
    /// Medium/low-speed CAN.
    CanMs,
}

/// CAN identifier width used during download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Not stated.
    #[default]
    Unknown,
    /// 11-bit identifiers.
    CanStandard,
    /// 29-bit identifiers.
    CanExtended,
}

/// Parsed VBF text header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VbfHeader {
    /// Format version, 1 through 3.
    pub version: f64,
    /// Free-text description lines.
    pub description: Vec<String>,
    /// Software part number.
    pub sw_part_number: String,
    /// Software version string.
    pub sw_version: String,
    /// Part kind.
    pub sw_part_type: SwPartType,
    /// Delivery bus.
    pub network: NetworkType,
    /// ECU address.
    pub ecu_address: u32,
    /// Identifier width.
    pub frame_format: FrameFormat,
    /// Bootloader call address (`call`, `jmp` or `jsr`).
    pub call: u32,
    /// Whole-file checksum from the header.
    pub file_checksum: u32,
    /// Erase ranges: (start, length).
    pub erase: Vec<(u32, u32)>,
}

/// One binary chunk of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbfChunk {
    /// Flash address the chunk is written to.
    pub write_offset: u32,
    /// Chunk payload.
    pub data: Vec<u8>,
    /// CRC trailer (16-bit from version 2, 8-bit before).
    pub crc: u32,
}

impl VbfChunk {
    /// Chunk over `data` with a freshly computed CRC-16.
    pub fn new(write_offset: u32, data: Vec<u8>) -> Self {
        let crc = u32::from(crc16(&data));
        Self { write_offset, data, crc }
    }
}

/// A complete VBF artifact.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vbf {
    /// Text header.
    pub header: VbfHeader,
    /// Body chunks, in file order.
    pub chunks: Vec<VbfChunk>,
}

impl Vbf {
    /// Total number of payload bytes across all chunks.
    pub fn total_size(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, msg: &str) -> Error {
        Error::invalid(format!("VBF header: {msg} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_space(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.input.get(self.pos + 1) == Some(&b'/') => {
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        self.skip_space();
        if self.peek() != Some(c) {
            return Err(self.error(&format!("expected {:?}", char::from(c))));
        }
        self.pos += 1;
        Ok(())
    }

    fn ident(&mut self) -> Result<String> {
        self.skip_space();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected identifier"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).to_ascii_lowercase())
    }

    fn float(&mut self) -> Result<f64> {
        self.skip_space();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos])
            .parse()
            .map_err(|_| self.error("bad number"))
    }

    fn hex(&mut self) -> Result<u32> {
        self.skip_space();
        if !self.input[self.pos..].starts_with(b"0x") && !self.input[self.pos..].starts_with(b"0X")
        {
            return Err(self.error("expected 0x"));
        }
        self.pos += 2;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_hexdigit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        u32::from_str_radix(&String::from_utf8_lossy(&self.input[start..self.pos]), 16)
            .map_err(|_| self.error("bad hex number"))
    }

    fn quoted_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'"' || c == b'\n' {
                break;
            }
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        self.expect(b'"')?;
        Ok(s)
    }

    /// Everything up to the terminating `;`, trimmed.
    fn unquoted_string(&mut self) -> Result<String> {
        self.skip_space();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b';' || c == b'\n' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected value"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos])
            .trim_end()
            .to_string())
    }

    fn string_value(&mut self) -> Result<String> {
        self.skip_space();
        if self.peek() == Some(b'"') {
            self.quoted_string()
        } else {
            self.unquoted_string()
        }
    }

    fn header(&mut self) -> Result<VbfHeader> {
        let mut header = VbfHeader::default();
        if self.ident()? != "vbf_version" {
            return Err(self.error("missing vbf_version"));
        }
        self.expect(b'=')?;
        header.version = self.float()?;
        self.expect(b';')?;
        if self.ident()? != "header" {
            return Err(self.error("missing header block"));
        }
        self.expect(b'{')?;
        loop {
            self.skip_space();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }
            let key = self.ident()?;
            self.expect(b'=')?;
            match key.as_str() {
                "description" => {
                    self.expect(b'{')?;
                    loop {
                        header.description.push(self.string_value()?);
                        self.skip_space();
                        match self.peek() {
                            Some(b',') => self.pos += 1,
                            _ => break,
                        }
                    }
                    self.expect(b'}')?;
                }
                "sw_part_number" => header.sw_part_number = self.string_value()?,
                "sw_version" => header.sw_version = self.string_value()?,
                "sw_part_type" => {
                    header.sw_part_type = match self.string_value()?.to_ascii_lowercase().as_str()
                    {
                        "sbl" => SwPartType::Sbl,
                        "data" => SwPartType::Data,
                        "exe" => SwPartType::Exe,
                        "sigcfg" => SwPartType::SigCfg,
                        _ => SwPartType::Unknown,
                    }
                }
                "network" => {
                    header.network = match self.string_value()?.to_ascii_lowercase().as_str() {
                        "can_hs" => NetworkType::CanHs,
                        "can_ms" => NetworkType::CanMs,
                        _ => NetworkType::Unknown,
                    }
                }
                "ecu_address" | "ecu_addr" => header.ecu_address = self.hex()?,
                "frame_format" | "can_frame_format" => {
                    header.frame_format =
                        match self.string_value()?.to_ascii_lowercase().as_str() {
                            "can_standard" | "standard" => FrameFormat::CanStandard,
                            "can_extended" | "extended" => FrameFormat::CanExtended,
                            _ => FrameFormat::Unknown,
                        }
                }
                "call" | "jmp" | "jsr" => header.call = self.hex()?,
                "file_checksum" => header.file_checksum = self.hex()?,
                "erase" => {
                    self.expect(b'{')?;
                    loop {
                        self.expect(b'{')?;
                        let start = self.hex()?;
                        self.expect(b',')?;
                        let length = self.hex()?;
                        self.expect(b'}')?;
                        header.erase.push((start, length));
                        self.skip_space();
                        match self.peek() {
                            Some(b',') => self.pos += 1,
                            _ => break,
                        }
                    }
                    self.expect(b'}')?;
                }
                other => return Err(self.error(&format!("unknown key {other:?}"))),
            }
            self.expect(b';')?;
        }
        Ok(header)
    }

    /// Whitespace between the text header and the binary body (no
    /// comment handling here; the body is raw bytes).
    fn skip_ws_only(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn be32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.input.len() {
            return Err(Error::invalid("VBF body truncated"));
        }
        let v = u32::from_be_bytes(self.input[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn body(&mut self, version: f64) -> Result<Vec<VbfChunk>> {
        let mut chunks = Vec::new();
        while self.pos < self.input.len() {
            let write_offset = self.be32()?;
            let size = self.be32()? as usize;
            if self.pos + size > self.input.len() {
                return Err(Error::invalid("VBF chunk data truncated"));
            }
            let data = self.input[self.pos..self.pos + size].to_vec();
            self.pos += size;
            let crc = if version >= 2.0 {
                if self.pos + 2 > self.input.len() {
                    return Err(Error::invalid("VBF chunk CRC truncated"));
                }
                let crc =
                    u32::from(u16::from_be_bytes([self.input[self.pos], self.input[self.pos + 1]]));
                self.pos += 2;
                if crc != u32::from(crc16(&data)) {
                    return Err(Error::invalid(format!(
                        "chunk at {write_offset:#x}: CRC mismatch"
                    )));
                }
                crc
            } else {
                if self.pos >= self.input.len() {
                    return Err(Error::invalid("VBF chunk CRC truncated"));
                }
                let crc = u32::from(self.input[self.pos]);
                self.pos += 1;
                crc
            };
            chunks.push(VbfChunk { write_offset, data, crc });
        }
        Ok(chunks)
    }
}

fn validate(header: &VbfHeader) -> Result<()> {
    if !(1.0..=3.99).contains(&header.version) {
        return Err(Error::invalid(format!(
            "unsupported vbf_version {}",
            header.version
        )));
    }
    let mut ranges = header.erase.clone();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start_a, len_a) = pair[0];
        let (start_b, _) = pair[1];
        if u64::from(start_a) + u64::from(len_a) > u64::from(start_b) {
            return Err(Error::invalid("overlapping erase ranges"));
        }
    }
    Ok(())
}

/// Parse a complete VBF file.
pub fn parse(input: &[u8]) -> Result<Vbf> {
    let mut parser = Parser::new(input);
    let header = parser.header()?;
    validate(&header)?;
    parser.skip_ws_only();
    let chunks = parser.body(header.version)?;
    debug!(
        "parsed VBF {}: version {}, {} chunks, {} bytes",
        header.sw_part_number,
        header.version,
        chunks.len(),
        chunks.iter().map(|c| c.data.len()).sum::<usize>()
    );
    Ok(Vbf { header, chunks })
}

/// Render a VBF back to bytes: a canonical header followed by the exact
/// body record encoding.
pub fn serialize(vbf: &Vbf) -> Vec<u8> {
    let mut text = String::new();
    let _ = writeln!(text, "vbf_version = {};", vbf.header.version);
    let _ = writeln!(text, "header {{");
    if !vbf.header.description.is_empty() {
        let quoted: Vec<String> = vbf
            .header
            .description
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect();
        let _ = writeln!(text, "    description = {{ {} }};", quoted.join(", "));
    }
    if !vbf.header.sw_part_number.is_empty() {
        let _ = writeln!(text, "    sw_part_number = \"{}\";", vbf.header.sw_part_number);
    }
    if !vbf.header.sw_version.is_empty() {
        let _ = writeln!(text, "    sw_version = \"{}\";", vbf.header.sw_version);
    }
    match vbf.header.sw_part_type {
        SwPartType::Unknown => {}
        SwPartType::Sbl => text.push_str("    sw_part_type = SBL;\n"),
        SwPartType::Data => text.push_str("    sw_part_type = DATA;\n"),
        SwPartType::Exe => text.push_str("    sw_part_type = EXE;\n"),
        SwPartType::SigCfg => text.push_str("    sw_part_type = SIGCFG;\n"),
    }
    match vbf.header.network {
        NetworkType::Unknown => {}
        NetworkType::CanHs => text.push_str("    network = CAN_HS;\n"),
        NetworkType::CanMs => text.push_str("    network = CAN_MS;\n"),
    }
    if vbf.header.ecu_address != 0 {
        let _ = writeln!(text, "    ecu_address = 0x{:X};", vbf.header.ecu_address);
    }
    match vbf.header.frame_format {
        FrameFormat::Unknown => {}
        FrameFormat::CanStandard => text.push_str("    frame_format = CAN_STANDARD;\n"),
        FrameFormat::CanExtended => text.push_str("    frame_format = CAN_EXTENDED;\n"),
    }
    if vbf.header.call != 0 {
        let _ = writeln!(text, "    call = 0x{:X};", vbf.header.call);
    }
    if vbf.header.file_checksum != 0 {
        let _ = writeln!(text, "    file_checksum = 0x{:X};", vbf.header.file_checksum);
    }
    if !vbf.header.erase.is_empty() {
        let ranges: Vec<String> = vbf
            .header
            .erase
            .iter()
            .map(|(s, l)| format!("{{ 0x{s:X}, 0x{l:X} }}"))
            .collect();
        let _ = writeln!(text, "    erase = {{ {} }};", ranges.join(", "));
    }
    text.push_str("}\n");
    let mut out = text.into_bytes();
    out.extend_from_slice(&serialize_body(vbf));
    out
}

/// Render just the body records.
pub fn serialize_body(vbf: &Vbf) -> Vec<u8> {
    let mut out = Vec::with_capacity(vbf.total_size() + vbf.chunks.len() * 10);
    for chunk in &vbf.chunks {
        out.extend_from_slice(&chunk.write_offset.to_be_bytes());
        out.extend_from_slice(&(chunk.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&chunk.data);
        if vbf.header.version >= 2.0 {
            out.extend_from_slice(&(chunk.crc as u16).to_be_bytes());
        } else {
            out.push(chunk.crc as u8);
        }
    }
    out
}

fn chunked(data: &[u8], layout: &[(u32, Option<u32>)]) -> Result<Vec<VbfChunk>> {
    let mut chunks = Vec::with_capacity(layout.len());
    for &(offset, size) in layout {
        let start = offset as usize;
        let end = match size {
            Some(s) => start + s as usize,
            None => data.len(),
        };
        if end > data.len() || start >= end {
            return Err(Error::invalid("flash file too small for this ECU layout"));
        }
        chunks.push(VbfChunk::new(offset, data[start..end].to_vec()));
    }
    Ok(chunks)
}

/// Build a flashable artifact from a raw BIN dump, using the chunk
/// layout of the given platform/ECU. Known Bosch images get their
/// checksum zones refreshed first.
pub fn from_binary(
    platform: CarPlatform,
    ecu_id: u8,
    extra_info: &str,
    mut data: Vec<u8>,
) -> Result<Vbf> {
    use CarPlatform::*;
    let layout: &[(u32, Option<u32>)] = match (platform, ecu_id) {
        (P80 | P2 | P2_250, 0x7A) => &[(0x8000, Some(0x6000)), (0x10000, None)],
        (P1, 0x7A) => &[(0x20000, Some(0x70000)), (0xA0000, None)],
        (P3 | Ford, 0x10) if extra_info.eq_ignore_ascii_case("me9_p3") => &[
            (0x20000, Some(0x70000)),
            (0xA0000, Some(0x12_0000)),
            (0x1C2000, Some(0x1E000)),
            (0x1E0000, Some(0x2_0000)),
        ],
        (P80 | P1 | P2 | P2_250, 0x6E) | (P3 | Ford, 0x18) => &[
            (0x8000, Some(0x8000)),
            (0x10000, Some(0x10000)),
            (0x20000, Some(0x10000)),
            (0x30000, Some(0x10000)),
            (0x40000, Some(0x10000)),
            (0x50000, Some(0x10000)),
            (0x60000, Some(0x10000)),
            (0x70000, Some(0x10000)),
        ],
        _ => {
            return Err(Error::invalid(format!(
                "no BIN layout for ECU 0x{ecu_id:02X} on {platform:?}"
            )));
        }
    };
    if is_supported_image(&data) {
        update_image(&mut data);
    }
    Ok(Vbf {
        header: VbfHeader { version: 2.0, ..Default::default() },
        chunks: chunked(&data, layout)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> Vec<u8> {
        let mut file = Vec::new();
        file.extend_from_slice(
            b"// comment line\n\
              VBF_VERSION = 2.2 ;\n\
              header {\n\
                  description = { \"line one\", \"line two\" };\n\
                  sw_part_number = \"30668471 A\";\n\
                  sw_version = 2008a;\n\
                  sw_part_type = SBL;\n\
                  network = CAN_HS;\n\
                  ecu_address = 0x7A; // engine\n\
                  frame_format = CAN_STANDARD;\n\
                  call = 0x18000;\n\
                  file_checksum = 0x79C74529;\n\
                  erase = { { 0x8000, 0x6000 }, { 0x10000, 0x70000 } };\n\
              }",
        );
        let data: Vec<u8> = (0u16..16).map(|i| i as u8).collect();
        file.extend_from_slice(&0x8000u32.to_be_bytes());
        file.extend_from_slice(&16u32.to_be_bytes());
        file.extend_from_slice(&data);
        file.extend_from_slice(&crc16(&data).to_be_bytes());
        file
    }

    #[test]
    fn parse_sample() -> crate::Result<()> {
        let vbf = parse(&sample_file())?;
        assert_eq!(vbf.header.version, 2.2);
        assert_eq!(vbf.header.description, vec!["line one", "line two"]);
        assert_eq!(vbf.header.sw_part_number, "30668471 A");
        assert_eq!(vbf.header.sw_version, "2008a");
        assert_eq!(vbf.header.sw_part_type, SwPartType::Sbl);
        assert_eq!(vbf.header.network, NetworkType::CanHs);
        assert_eq!(vbf.header.ecu_address, 0x7A);
        assert_eq!(vbf.header.frame_format, FrameFormat::CanStandard);
        assert_eq!(vbf.header.call, 0x18000);
        assert_eq!(vbf.header.file_checksum, 0x79C74529);
        assert_eq!(vbf.header.erase, vec![(0x8000, 0x6000), (0x10000, 0x70000)]);
        assert_eq!(vbf.chunks.len(), 1);
        assert_eq!(vbf.chunks[0].write_offset, 0x8000);
        assert_eq!(vbf.chunks[0].data.len(), 16);
        Ok(())
    }

    #[test]
    fn chunk_crc_is_verified() {
        let mut file = sample_file();
        let last = file.len() - 1;
        file[last] ^= 0xFF;
        assert!(parse(&file).is_err());
    }

    #[test]
    fn version_range_enforced() {
        let mut file = sample_file();
        // Patch "2.2" into "4.2".
        let pos = file.windows(3).position(|w| w == b"2.2").unwrap();
        file[pos] = b'4';
        assert!(parse(&file).is_err());
    }

    #[test]
    fn overlapping_erase_rejected() {
        let text = b"vbf_version = 2.0;\nheader { erase = { { 0x8000, 0x6000 }, { 0x9000, 0x100 } }; }";
        assert!(parse(text).is_err());
    }

    #[test]
    fn roundtrip_via_serialize() -> crate::Result<()> {
        let vbf = parse(&sample_file())?;
        let rendered = serialize(&vbf);
        let reparsed = parse(&rendered)?;
        assert_eq!(vbf, reparsed);
        // Body bytes survive exactly.
        let body_start = sample_file().len() - 26;
        assert_eq!(&rendered[rendered.len() - 26..], &sample_file()[body_start..]);
        Ok(())
    }

    #[test]
    fn version1_has_byte_crc() -> crate::Result<()> {
        let mut file = b"vbf_version = 1.0;\nheader { }".to_vec();
        file.extend_from_slice(&0x4000u32.to_be_bytes());
        file.extend_from_slice(&3u32.to_be_bytes());
        file.extend_from_slice(&[9, 9, 9]);
        file.push(0x5A);
        let vbf = parse(&file)?;
        assert_eq!(vbf.chunks[0].crc, 0x5A);
        Ok(())
    }

    #[test]
    fn binary_layout_me7() -> crate::Result<()> {
        let data = vec![0x11u8; 0x8_0000];
        let vbf = from_binary(CarPlatform::P2, 0x7A, "", data)?;
        assert_eq!(vbf.chunks.len(), 2);
        assert_eq!(vbf.chunks[0].write_offset, 0x8000);
        assert_eq!(vbf.chunks[0].data.len(), 0x6000);
        assert_eq!(vbf.chunks[1].write_offset, 0x10000);
        assert_eq!(vbf.chunks[1].data.len(), 0x8_0000 - 0x10000);
        assert_eq!(vbf.chunks[0].crc, u32::from(crc16(&vbf.chunks[0].data)));
        assert!(from_binary(CarPlatform::P2, 0x7A, "", vec![0; 16]).is_err());
        Ok(())
    }
}
