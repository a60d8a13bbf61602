/*! Protocol steps for D2 flashing: bus sleep/wake, primary bootloader
entry, data transfer with the additive checksum handshake, erase, and
flash read-out.

The bootloader dialogue is echo-based: a raw command is answered by a
frame whose payload echoes a marker byte (`0x9C` for set-address,
`0xC6` for PBL entry, `0xF9` for erase, ...) at offset one. The helpers
here write a message and scan a bounded number of frames for the
expected echo.
*/
use std::thread::sleep;
use std::time::Duration;

use log::{debug, warn};

use crate::adapter::{Channel, Message, PeriodicId, Protocol};
use crate::checksum::image_checksum;
use crate::d2::{D2Request, messages};
use crate::vbf::Vbf;
use crate::{Error, Result};

const ECHO_READ_TIMEOUT_MS: u32 = 3000;

/// Write a message and scan up to `count` frames for a payload whose
/// bytes at offset one match any of `expected`.
fn write_and_check(
    channel: &Channel,
    message: &dyn Message,
    expected: &[&[u8]],
    count: usize,
) -> Result<bool> {
    channel.send(message, 5000)?;
    for _ in 0..count {
        let frames = channel.read(1, ECHO_READ_TIMEOUT_MS)?;
        for frame in &frames {
            let payload = frame.payload();
            for check in expected {
                if payload.len() > check.len()
                    && check.iter().eq(payload[1..1 + check.len()].iter())
                {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn write_offset_and_check(channel: &Channel, ecu_id: u8, offset: u32) -> Result<()> {
    let message = messages::set_memory_addr(ecu_id, offset);
    for _ in 0..10 {
        if write_and_check(channel, &message, &[&[0x9C]], 10)? {
            return Ok(());
        }
        sleep(Duration::from_secs(1));
    }
    Err(Error::flash("ECU did not acknowledge memory address"))
}

/// Put the buses to sleep: broadcast the go-to-sleep request at 5 ms
/// for three seconds on every CAN channel.
pub fn fall_asleep(channels: &[Channel]) -> Result<()> {
    let msg = messages::go_to_sleep();
    let mut ids: Vec<(usize, PeriodicId)> = Vec::new();
    for (i, channel) in channels.iter().enumerate() {
        if channel.protocol() == Protocol::Iso9141 {
            continue;
        }
        ids.push((i, channel.start_periodic(&msg, 5)?));
    }
    sleep(Duration::from_secs(3));
    for (i, id) in ids {
        channels[i].stop_periodic_all(&[id]);
    }
    Ok(())
}

/// Wake every CAN bus back up.
pub fn wake_up(channels: &[Channel]) {
    let msg = messages::wake_up();
    for channel in channels {
        if channel.protocol() == Protocol::Iso9141 {
            continue;
        }
        if let Err(e) = channel.send(&msg, 5000) {
            warn!("wake-up write failed: {e}");
        }
    }
}

/// Enter the primary bootloader.
pub fn start_pbl(channel: &Channel, ecu_id: u8) -> Result<()> {
    if !write_and_check(
        channel,
        &messages::start_primary_bootloader(ecu_id),
        &[&[0xC6]],
        10,
    )? {
        return Err(Error::flash("ECU did not enter primary bootloader"));
    }
    Ok(())
}

/// Transfer every chunk of an artifact: set the write address, stream
/// the data frames, then have the ECU confirm the additive checksum.
pub fn transfer_data(
    channel: &Channel,
    ecu_id: u8,
    vbf: &Vbf,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    for chunk in &vbf.chunks {
        debug!(
            "writing chunk at {:#x}, {} bytes",
            chunk.write_offset,
            chunk.data.len()
        );
        write_offset_and_check(channel, ecu_id, chunk.write_offset)?;
        for batch in messages::write_data_msgs(ecu_id, &chunk.data) {
            channel.clear_rx()?;
            let sent = channel.send(&batch, 50_000)?;
            progress(6 * sent);
        }
        write_offset_and_check(channel, ecu_id, chunk.write_offset)?;
        let end_offset = chunk.write_offset + chunk.data.len() as u32;
        let checksum = image_checksum(&chunk.data);
        if !write_and_check(
            channel,
            &messages::calculate_checksum(ecu_id, end_offset),
            &[&[0xB1, checksum]],
            10,
        )? {
            return Err(Error::flash("checksums are not equal"));
        }
    }
    Ok(())
}

/// Erase the flash region of every chunk. The ECU echoes `F9 00` or
/// `F9 02` when the sector is gone.
pub fn erase(channel: &Channel, ecu_id: u8, vbf: &Vbf) -> Result<()> {
    for chunk in &vbf.chunks {
        write_offset_and_check(channel, ecu_id, chunk.write_offset)?;
        sleep(Duration::from_millis(1000));
        if !write_and_check(
            channel,
            &messages::erase(ecu_id),
            &[&[0xF9, 0x00], &[0xF9, 0x02]],
            30,
        )? {
            return Err(Error::flash("cannot erase memory"));
        }
    }
    Ok(())
}

/// Jump into previously transferred code at `addr`.
pub fn start_routine(channel: &Channel, ecu_id: u8, addr: u32) -> Result<()> {
    write_offset_and_check(channel, ecu_id, addr)?;
    if !write_and_check(channel, &messages::jump_to(ecu_id), &[&[0xA0]], 10)? {
        return Err(Error::flash("cannot start routine"));
    }
    Ok(())
}

/// Read `size` bytes of ECU memory starting at `start`.
pub fn read_memory(
    channel: &Channel,
    ecu_id: u8,
    start: u32,
    size: u32,
    progress: &mut dyn FnMut(usize),
) -> Result<Vec<u8>> {
    const CHUNK: u32 = 0x80;
    let mut result = Vec::with_capacity(size as usize);
    let mut addr = start;
    let end = start + size;
    while addr < end {
        let take = CHUNK.min(end - addr) as u8;
        let request =
            D2Request::from_message(messages::read_memory_by_offset(ecu_id, addr, take));
        let response = request.process(channel, 5000)?;
        // The reply echoes the 24-bit address and a status byte ahead
        // of the data.
        if response.len() < 4 + usize::from(take) {
            return Err(Error::frame("short memory read response"));
        }
        result.extend_from_slice(&response[4..4 + usize::from(take)]);
        progress(usize::from(take));
        addr += u32::from(take);
    }
    Ok(result)
}

/// Set the dashboard clock after a wake-up.
pub fn set_dim_time(channels: &[Channel], hours: u8, minutes: u8) {
    let msg = messages::set_current_time(hours, minutes);
    for channel in channels {
        if channel.protocol() == Protocol::Iso9141 {
            continue;
        }
        if let Err(e) = channel.send(&msg, 5000) {
            warn!("setting dashboard clock failed: {e}");
        }
    }
}
