/*! KWP 2000 protocol steps, used over a TP 2.0 session (and over plain
UDS channels on hybrid platforms). All requests go through the
[`RequestProcessor`] seam, so the same flasher plan serves both
transports.
*/
use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::checksum::crc16;
use crate::processor::RequestProcessor;
use crate::security::generate_key_common;
use crate::vbf::{Vbf, VbfChunk};
use crate::{Error, Result, be32};

const DEFAULT_TIMEOUT_MS: u32 = 3000;

/// Unlock security access with the rotate/XOR common key: request the
/// 32-bit seed, fold it, send the key back.
pub fn authorize(proc: &mut dyn RequestProcessor) -> Result<()> {
    let seed_response = proc.process(&[0x27, 0x01], &[], DEFAULT_TIMEOUT_MS)?;
    if seed_response.len() < 6 || seed_response[0] != 0x67 || seed_response[1] != 0x01 {
        return Err(Error::flash("security access seed not granted"));
    }
    let seed = u32::from_be_bytes([
        seed_response[2],
        seed_response[3],
        seed_response[4],
        seed_response[5],
    ]);
    let key = generate_key_common(seed);
    let mut request = vec![0x27, 0x02];
    request.extend_from_slice(&be32(key));
    let key_response = proc.process(&request, &[], DEFAULT_TIMEOUT_MS)?;
    if key_response.len() < 2 || key_response[0] != 0x67 || key_response[1] != 0x02 {
        return Err(Error::flash("security access key rejected"));
    }
    Ok(())
}

/// Switch into the programming session: request it, drop the
/// transport, reconnect after the ECU reboots and authorize again.
pub fn enter_programming_session(proc: &mut dyn RequestProcessor) -> Result<()> {
    proc.process(&[0x10, 0x85], &[], DEFAULT_TIMEOUT_MS)?;
    sleep(Duration::from_millis(500));
    proc.disconnect()?;
    sleep(Duration::from_millis(500));
    proc.connect()?;
    authorize(proc)
}

/// Request a download of one chunk; returns the block size the ECU
/// grants.
pub fn request_download(proc: &mut dyn RequestProcessor, chunk: &VbfChunk) -> Result<usize> {
    let addr = be32(chunk.write_offset);
    let size = be32(chunk.data.len() as u32);
    let params = [
        addr[1], addr[2], addr[3], // 24-bit address
        0x11, // uncompressed, no encryption
        size[1], size[2], size[3], // 24-bit length
    ];
    let response = proc.process(&[0x34], &params, DEFAULT_TIMEOUT_MS)?;
    match response.len() {
        0..=1 => Err(Error::flash("request-download rejected")),
        2 => Ok(usize::from(response[1])),
        _ => Ok(usize::from(response[1]) << 8 | usize::from(response[2])),
    }
}

/// Erase the flash range of one chunk (routine `0x31 0xC4` with start
/// and end address), then poll the routine results.
pub fn erase_chunk(proc: &mut dyn RequestProcessor, chunk: &VbfChunk) -> Result<()> {
    let start = be32(chunk.write_offset);
    let end = be32(chunk.write_offset + chunk.data.len() as u32 - 1);
    let params = [
        start[1], start[2], start[3],
        end[1], end[2], end[3],
        0, 1, 2, 3, 4, 5,
    ];
    proc.process(&[0x31, 0xC4], &params, 10_000)?;
    proc.process(&[0x33, 0xC4], &[], 10_000)?;
    Ok(())
}

/// Erase every chunk of an artifact.
pub fn erase(proc: &mut dyn RequestProcessor, vbf: &Vbf) -> Result<()> {
    for chunk in &vbf.chunks {
        erase_chunk(proc, chunk)?;
    }
    Ok(())
}

/// Stream one chunk in `0x36` blocks with a 1-based block counter,
/// then close with `0x37` and verify the CRC-16 when the ECU reports
/// one.
pub fn transfer_chunk(
    proc: &mut dyn RequestProcessor,
    chunk: &VbfChunk,
    max_block: usize,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    let block_size = max_block
        .checked_sub(5)
        .filter(|s| *s > 0)
        .ok_or_else(|| Error::flash("granted block size too small"))?;
    let mut counter: u8 = 1;
    for block in chunk.data.chunks(block_size) {
        proc.process(&[0x36, counter], block, 60_000)?;
        progress(block.len());
        counter = counter.wrapping_add(1);
        if counter == 0 {
            counter = 1;
        }
    }
    let exit = proc.process(&[0x37], &[], 10_000)?;
    if exit.len() >= 3 {
        let reported = u16::from(exit[1]) << 8 | u16::from(exit[2]);
        let expected = crc16(&chunk.data);
        if reported != expected {
            return Err(Error::flash(format!(
                "transfer CRC mismatch: ECU reports {reported:#06x}, expected {expected:#06x}"
            )));
        }
    }
    Ok(())
}

/// Download every chunk: request-download, stream, transfer-exit.
pub fn transfer_data(
    proc: &mut dyn RequestProcessor,
    vbf: &Vbf,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    for chunk in &vbf.chunks {
        debug!(
            "KWP transfer of chunk at {:#x}, {} bytes",
            chunk.write_offset,
            chunk.data.len()
        );
        let max_block = request_download(proc, chunk)?;
        transfer_chunk(proc, chunk, max_block, progress)?;
    }
    Ok(())
}

/// Start the routine at the bootloader call address.
pub fn start_routine(proc: &mut dyn RequestProcessor, addr: u32) -> Result<()> {
    let a = be32(addr);
    let response = proc.process(&[0x31, 0x01, 0x03, 0x01, a[0], a[1], a[2], a[3]], &[], 5000)?;
    if response.len() < 4 || response[..4] != [0x71, 0x01, 0x03, 0x01] {
        return Err(Error::flash("routine start rejected"));
    }
    Ok(())
}
