/*! Protocol steps shared by the UDS flasher and the PIN scanner:
falling asleep, keep-alive, security access, wake-up, and the
download/erase primitives.
*/
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};

use crate::adapter::{Channel, PeriodicId};
use crate::isotp::UdsMessage;
use crate::security::generate_key;
use crate::uds::{NRC_TIME_DELAY, UdsRequest};
use crate::vbf::{Vbf, VbfChunk};
use crate::{Error, Result, be32};

/// Functional broadcast id for session control and tester-present.
pub const BROADCAST_CAN_ID: u32 = 0x7DF;

const AUTHORIZE_ATTEMPTS: usize = 5;
const AUTHORIZE_BACKOFF: Duration = Duration::from_secs(5);
const ERASE_ATTEMPTS: usize = 10;
const ERASE_BACKOFF: Duration = Duration::from_millis(500);

/// Silence all normal traffic: hammer a diagnostic-session request on
/// every bus for two seconds.
pub fn fall_asleep(channels: &[Channel]) -> Result<()> {
    let msg = UdsMessage::new(BROADCAST_CAN_ID, vec![0x10, 0x02]);
    let mut ids: Vec<(usize, PeriodicId)> = Vec::new();
    for (i, channel) in channels.iter().enumerate() {
        ids.push((i, channel.start_periodic(&msg, 5)?));
    }
    sleep(Duration::from_secs(2));
    for (i, id) in ids {
        channels[i].stop_periodic_all(&[id]);
    }
    Ok(())
}

/// Start the 1900 ms tester-present heart-beat.
pub fn keep_alive(channel: &Channel) -> Result<PeriodicId> {
    channel.start_periodic(&UdsMessage::new(BROADCAST_CAN_ID, vec![0x3E, 0x80]), 1900)
}

/// Wake the buses back up with two bursts of ECU-reset requests.
pub fn wake_up(channels: &[Channel]) {
    for reset_kind in [0x11u8, 0x81] {
        let msg = UdsMessage::new(BROADCAST_CAN_ID, vec![0x11, reset_kind]);
        let mut ids: Vec<(usize, PeriodicId)> = Vec::new();
        for (i, channel) in channels.iter().enumerate() {
            match channel.start_periodic(&msg, 20) {
                Ok(id) => ids.push((i, id)),
                Err(e) => {
                    warn!("wake-up periodic failed: {e}");
                    continue;
                }
            }
        }
        sleep(Duration::from_millis(200));
        for (i, id) in ids {
            channels[i].stop_periodic_all(&[id]);
        }
    }
}

/// Unlock security access: request the seed, derive the key from the
/// PIN, send it back.
///
/// NRC `0x37` (required time delay) is retried with a five second
/// backoff, up to five attempts; any other failure propagates.
pub fn authorize(channel: &Channel, can_id: u32, pin: &[u8; 5]) -> Result<()> {
    let mut last = Error::Timeout;
    for attempt in 0..AUTHORIZE_ATTEMPTS {
        if attempt > 0 {
            sleep(AUTHORIZE_BACKOFF);
        }
        match authorize_once(channel, can_id, pin) {
            Ok(()) => {
                info!("security access granted");
                return Ok(());
            }
            Err(Error::Uds(NRC_TIME_DELAY)) => {
                debug!("security access: time delay not expired, backing off");
                last = Error::Uds(NRC_TIME_DELAY);
            }
            Err(other) => return Err(other),
        }
    }
    Err(last)
}

fn authorize_once(channel: &Channel, can_id: u32, pin: &[u8; 5]) -> Result<()> {
    channel.clear_rx()?;
    let seed_response = UdsRequest::new(can_id, vec![0x27, 0x01])?.process(channel, 3000)?;
    if seed_response.len() < 9 {
        return Err(Error::frame("security access seed too short"));
    }
    let seed = [seed_response[6], seed_response[7], seed_response[8]];
    let key = generate_key(pin, &seed);
    channel.clear_rx()?;
    let key_response =
        UdsRequest::new(can_id, vec![0x27, 0x02, key[0], key[1], key[2]])?.process(channel, 3000)?;
    if key_response.len() < 6 || key_response[5] != 0x02 {
        return Err(Error::flash("security access key rejected"));
    }
    Ok(())
}

/// Download one chunk: request-download, transfer blocks, transfer-exit
/// with the CRC-16 check. `progress` sees transferred byte counts.
pub fn transfer_chunk(
    channel: &Channel,
    can_id: u32,
    chunk: &VbfChunk,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    let addr = be32(chunk.write_offset);
    let size = be32(chunk.data.len() as u32);
    let mut request = vec![0x34, 0x00, 0x44];
    request.extend_from_slice(&addr);
    request.extend_from_slice(&size);
    let download = UdsRequest::new(can_id, request)?.process_expect(channel, &[0x20], 10, 3000)?;
    if download.len() < 2 {
        return Err(Error::flash("request-download response too short"));
    }
    let max_block = (usize::from(download[0]) << 8 | usize::from(download[1]))
        .checked_sub(2)
        .ok_or_else(|| Error::flash("request-download block size too small"))?;
    if max_block == 0 {
        return Err(Error::flash("request-download block size too small"));
    }

    let mut counter: u8 = 1;
    for block in chunk.data.chunks(max_block) {
        let mut data = vec![0x36, counter];
        data.extend_from_slice(block);
        channel.clear_rx()?;
        UdsRequest::new(can_id, data)?.process_expect(channel, &[counter], 10, 60_000)?;
        progress(block.len());
        counter = counter.wrapping_add(1);
    }

    let crc = [(chunk.crc >> 8) as u8, chunk.crc as u8];
    channel.clear_rx()?;
    UdsRequest::new(can_id, vec![0x37])?.process_expect(channel, &crc, 3, 10_000)?;
    Ok(())
}

/// Download every chunk of an artifact.
pub fn transfer_data(
    channel: &Channel,
    can_id: u32,
    vbf: &Vbf,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    for chunk in &vbf.chunks {
        debug!(
            "transferring chunk at {:#x}, {} bytes",
            chunk.write_offset,
            chunk.data.len()
        );
        transfer_chunk(channel, can_id, chunk, progress)?;
    }
    Ok(())
}

/// Run the erase routine for every chunk, retrying each up to ten
/// times with a 500 ms backoff.
pub fn erase(channel: &Channel, can_id: u32, vbf: &Vbf) -> Result<()> {
    for chunk in &vbf.chunks {
        let mut request = vec![0x31, 0x01, 0xFF, 0x00];
        request.extend_from_slice(&be32(chunk.write_offset));
        request.extend_from_slice(&be32(chunk.data.len() as u32));
        let mut done = false;
        let mut last = Error::Timeout;
        for attempt in 0..ERASE_ATTEMPTS {
            if attempt > 0 {
                sleep(ERASE_BACKOFF);
            }
            match UdsRequest::new(can_id, request.clone())?.process_expect(
                channel,
                &[0x01, 0xFF, 0x00, 0x00],
                10,
                5000,
            ) {
                Ok(_) => {
                    done = true;
                    break;
                }
                Err(e) => {
                    debug!("erase at {:#x} failed: {e}", chunk.write_offset);
                    last = e;
                }
            }
        }
        if !done {
            return Err(last);
        }
    }
    Ok(())
}

/// Start the routine at the bootloader call address.
pub fn start_routine(channel: &Channel, can_id: u32, call: u32) -> Result<()> {
    let mut request = vec![0x31, 0x01, 0x03, 0x01];
    request.extend_from_slice(&be32(call));
    UdsRequest::new(can_id, request)?.process_expect(channel, &[0x01, 0x03, 0x01], 10, 3000)?;
    Ok(())
}
