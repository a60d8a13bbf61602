/*! Platform → bus → ECU configuration and channel-opening presets.

The original tool ships this as a bundled text configuration; here the
same data is a static table. Lookups answer two questions: which buses
does a platform have, and on which bus (and CAN id) does a given ECU
live.
*/
use log::{debug, warn};

use crate::adapter::{
    self, CanFrame, Channel, ConfigParam, Device, FilterKind, Ioctl, Protocol,
};
use crate::{Error, Result};

/// Supported car platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarPlatform {
    /// 1990s platform, D2 over 250 kbps CAN behind a K-line bridge.
    P80,
    /// Small-car platform, D2 over high-speed CAN.
    P1,
    /// 2000s platform, D2 over high-speed CAN.
    P2,
    /// P2 variant with the 250 kbps powertrain bus.
    P2_250,
    /// UDS platform.
    P3,
    /// Later UDS platform.
    Spa,
    /// UDS, Ford-sourced modules.
    Ford,
    /// KWP 2000 over TP 2.0.
    Vag,
    /// UDS without DDDI support (slow logger path).
    Haval,
}

impl CarPlatform {
    /// Parse the CLI spelling of a platform name.
    pub fn parse(input: &str) -> Result<Self> {
        Ok(match input.to_ascii_uppercase().as_str() {
            "P80" => CarPlatform::P80,
            "P1" => CarPlatform::P1,
            "P2" => CarPlatform::P2,
            "P2_250" => CarPlatform::P2_250,
            "P3" => CarPlatform::P3,
            "SPA" => CarPlatform::Spa,
            "FORD" => CarPlatform::Ford,
            "VAG" => CarPlatform::Vag,
            "HAVAL" => CarPlatform::Haval,
            other => return Err(Error::invalid(format!("unknown platform {other:?}"))),
        })
    }
}

/// Detect the platform from a VIN, if it is one of ours.
pub fn platform_from_vin(vin: &str) -> Option<CarPlatform> {
    let rest = vin.strip_prefix("YV1")?;
    match rest.chars().next()? {
        'L' => Some(CarPlatform::P80),
        'M' => Some(CarPlatform::P1),
        'T' | 'R' | 'S' => Some(CarPlatform::P2),
        _ => None,
    }
}

/// One ECU on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuInfo {
    /// Protocol-level ECU id.
    pub ecu_id: u8,
    /// CAN id the ECU answers on (UDS request id, or TP 2.0 setup
    /// response id).
    pub can_id: u32,
    /// Short module name.
    pub name: &'static str,
}

/// One bus of a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Bus name for logs.
    pub name: &'static str,
    /// Protocol used to open the channel.
    pub protocol: Protocol,
    /// Bus speed in bits per second.
    pub baudrate: u32,
    /// CAN identifier width in bits.
    pub can_id_bits: u32,
    /// ECUs reachable on this bus.
    pub ecus: &'static [EcuInfo],
}

/// Full bus layout of one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Platform this layout belongs to.
    pub platform: CarPlatform,
    /// Buses in channel-opening order.
    pub buses: Vec<BusConfig>,
}

const D2_HS_ECUS: &[EcuInfo] = &[
    EcuInfo { ecu_id: 0x7A, can_id: 0x000F_FFFE, name: "ECM" },
    EcuInfo { ecu_id: 0x6E, can_id: 0x000F_FFFE, name: "TCM" },
    EcuInfo { ecu_id: 0x58, can_id: 0x000F_FFFE, name: "SRS" },
    EcuInfo { ecu_id: 0x01, can_id: 0x000F_FFFE, name: "BCM" },
];

const D2_LS_ECUS: &[EcuInfo] = &[
    EcuInfo { ecu_id: 0x50, can_id: 0x000F_FFFE, name: "CEM" },
    EcuInfo { ecu_id: 0x51, can_id: 0x000F_FFFE, name: "DIM" },
];

const UDS_HS_ECUS: &[EcuInfo] = &[
    EcuInfo { ecu_id: 0x10, can_id: 0x7E0, name: "ECM" },
    EcuInfo { ecu_id: 0x18, can_id: 0x7E1, name: "TCM" },
    EcuInfo { ecu_id: 0x40, can_id: 0x730, name: "BCM" },
];

const UDS_LS_ECUS: &[EcuInfo] = &[
    EcuInfo { ecu_id: 0x50, can_id: 0x726, name: "CEM" },
    EcuInfo { ecu_id: 0x51, can_id: 0x720, name: "DIM" },
];

const VAG_ECUS: &[EcuInfo] = &[
    // TP 2.0 setup responses arrive on 0x200 + ecu id.
    EcuInfo { ecu_id: 0x01, can_id: 0x201, name: "ECM" },
    EcuInfo { ecu_id: 0x02, can_id: 0x202, name: "TCM" },
];

/// The bus layout for a platform.
pub fn platform_config(platform: CarPlatform) -> PlatformConfig {
    use CarPlatform::*;
    let buses = match platform {
        P80 | P2_250 => vec![
            BusConfig {
                name: "HS-250",
                protocol: Protocol::Can,
                baudrate: 250_000,
                can_id_bits: 11,
                ecus: D2_HS_ECUS,
            },
            BusConfig {
                name: "LS",
                protocol: Protocol::CanXonXoff,
                baudrate: 125_000,
                can_id_bits: 11,
                ecus: D2_LS_ECUS,
            },
        ],
        P1 | P2 => vec![
            BusConfig {
                name: "HS",
                protocol: Protocol::Can,
                baudrate: 500_000,
                can_id_bits: 11,
                ecus: D2_HS_ECUS,
            },
            BusConfig {
                name: "LS",
                protocol: Protocol::CanXonXoff,
                baudrate: 125_000,
                can_id_bits: 11,
                ecus: D2_LS_ECUS,
            },
        ],
        P3 | Spa | Ford | Haval => vec![
            BusConfig {
                name: "HS",
                protocol: Protocol::IsoTp,
                baudrate: 500_000,
                can_id_bits: 11,
                ecus: UDS_HS_ECUS,
            },
            BusConfig {
                name: "LS",
                protocol: Protocol::CanXonXoff,
                baudrate: 125_000,
                can_id_bits: 11,
                ecus: UDS_LS_ECUS,
            },
        ],
        Vag => vec![BusConfig {
            name: "HS",
            protocol: Protocol::Can,
            baudrate: 500_000,
            can_id_bits: 11,
            ecus: VAG_ECUS,
        }],
    };
    PlatformConfig { platform, buses }
}

/// The bus and ECU entry for an ECU id on a platform.
pub fn ecu_info(platform: CarPlatform, ecu_id: u8) -> Result<(BusConfig, EcuInfo)> {
    let conf = platform_config(platform);
    for bus in conf.buses {
        if let Some(ecu) = bus.ecus.iter().find(|e| e.ecu_id == ecu_id) {
            return Ok((bus.clone(), *ecu));
        }
    }
    Err(Error::invalid(format!(
        "ECU 0x{ecu_id:02X} not present on {platform:?}"
    )))
}

/// Index of the channel (in [`open_all_channels`] order) that reaches
/// the given ECU.
pub fn channel_index_for_ecu(platform: CarPlatform, ecu_id: u8) -> Result<usize> {
    let conf = platform_config(platform);
    conf.buses
        .iter()
        .position(|bus| bus.ecus.iter().any(|e| e.ecu_id == ecu_id))
        .ok_or_else(|| Error::invalid(format!("ECU 0x{ecu_id:02X} not present on {platform:?}")))
}

fn pass_everything_filter(channel: &Channel) -> Result<()> {
    let mask = CanFrame::new(0, &[]);
    let pattern = CanFrame::new(0, &[]);
    channel.set_filter(FilterKind::Pass, &mask, &pattern, None)?;
    Ok(())
}

/// XON/XOFF gating frame table for the vendor low-speed variant.
const XON_XOFF_TABLE: [[u8; 8]; 6] = [
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff, 0x00],
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xA9, 0x00, 0x00],
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff, 0x00],
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xA9, 0x01, 0x00],
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xff, 0xff, 0x00],
    [0x00, 0x00, 0x00, 0x01, 0x00, 0xA9, 0x02, 0x00],
];

fn base_can_config(channel: &Channel, baudrate: u32) -> Result<()> {
    channel.set_config(&[
        (ConfigParam::DataRate, baudrate),
        (ConfigParam::Loopback, 0),
        (
            ConfigParam::BitSamplePoint,
            if baudrate == 500_000 { 80 } else { 68 },
        ),
    ])
}

/// Open a raw CAN channel with the high-speed preset.
pub fn open_can_channel(
    device: &Device,
    flags: u32,
    baudrate: u32,
) -> Result<Channel> {
    let channel = device.connect(Protocol::Can, flags, baudrate)?;
    base_can_config(&channel, baudrate)?;
    pass_everything_filter(&channel)?;
    Ok(channel)
}

/// Open the 125 kbps low-speed bus: try the vendor XON/XOFF variant
/// first, fall back to the programmable-pin channel.
pub fn open_low_speed_channel(device: &Device, flags: u32) -> Result<Channel> {
    let baudrate = 125_000;
    for protocol in [Protocol::CanXonXoff, Protocol::CanPs] {
        let mut local_flags = flags;
        if protocol == Protocol::CanXonXoff {
            local_flags |= adapter::FLAG_PHYSICAL_CHANNEL;
        }
        let channel = match device.connect(protocol, local_flags, baudrate) {
            Ok(c) => c,
            Err(e) => {
                debug!("low-speed {protocol:?} not available: {e}");
                continue;
            }
        };
        if protocol == Protocol::CanPs {
            channel.set_config(&[(ConfigParam::J1962Pins, 0x030B)])?;
        }
        base_can_config(&channel, baudrate)?;
        pass_everything_filter(&channel)?;
        if protocol == Protocol::CanXonXoff {
            let table = XON_XOFF_TABLE
                .iter()
                .map(|p| CanFrame::from_raw(p.to_vec()))
                .collect::<Result<Vec<_>>>()?;
            channel.ioctl(&Ioctl::XonXoffFilter(table))?;
            channel.ioctl(&Ioctl::XonXoffFilterActive)?;
            channel.set_config(&[(ConfigParam::CanXonXoff, 0)])?;
        }
        return Ok(channel);
    }
    Err(Error::Adapter(adapter::AdapterError::NotSupported))
}

/// Open an ISO-TP channel for one ECU. Installs the flow-control filter
/// pair for the ECU's request/response ids and pads outgoing frames.
pub fn open_isotp_channel(device: &Device, baudrate: u32, can_id: u32) -> Result<Channel> {
    let mut channel = device.connect(Protocol::IsoTp, 0, baudrate)?;
    channel.set_config(&[(ConfigParam::DataRate, baudrate), (ConfigParam::Loopback, 0)])?;
    channel.set_tx_flags(adapter::TXFLAG_ISO15765_FRAME_PAD);
    if can_id != 0 {
        let mask = CanFrame::new(0xFFFF_FFFF, &[]);
        let pattern = CanFrame::new(can_id + 8, &[]);
        let flow = CanFrame::new(can_id, &[]);
        channel.set_filter(FilterKind::FlowControl, &mask, &pattern, Some(&flow))?;
    } else {
        pass_everything_filter(&channel)?;
    }
    Ok(channel)
}

/// Narrow a raw CAN channel down to one TP 2.0 data channel id.
pub fn prepare_tp20_channel(channel: &Channel, rx_id: u32) -> Result<()> {
    let mask = CanFrame::new(0xFFFF_FFFF, &[]);
    let pattern = CanFrame::new(rx_id, &[]);
    channel.set_filter(FilterKind::Pass, &mask, &pattern, None)?;
    Ok(())
}

/// Open the ISO 9141 K-line bridge channel that keeps the gateway on
/// 250 kbps platforms awake.
pub fn open_bridge_channel(device: &Device) -> Result<Channel> {
    let channel = device.connect(
        Protocol::Iso9141,
        adapter::FLAG_ISO9141_K_LINE_ONLY,
        10_400,
    )?;
    channel.set_config(&[
        (ConfigParam::Parity, 0),
        (ConfigParam::W0, 60),
        (ConfigParam::W1, 600),
        (ConfigParam::P4Min, 0),
    ])?;
    let keepalive = CanFrame::from_raw(vec![0x84, 0x40, 0x13, 0xb2, 0xf0, 0x03])?;
    channel.start_periodic(&keepalive, 2000)?;
    Ok(channel)
}

/// Open just the bus that reaches one ECU.
pub fn open_channel_for_ecu(
    device: &Device,
    platform: CarPlatform,
    ecu_id: u8,
) -> Result<Channel> {
    let (bus, ecu) = ecu_info(platform, ecu_id)?;
    match bus.protocol {
        Protocol::Can => {
            let flags = if bus.can_id_bits == 29 {
                adapter::FLAG_CAN_29BIT_ID
            } else {
                0
            };
            open_can_channel(device, flags, bus.baudrate)
        }
        Protocol::CanXonXoff | Protocol::CanPs => {
            open_low_speed_channel(device, adapter::FLAG_CAN_ID_BOTH)
        }
        Protocol::IsoTp => open_isotp_channel(device, bus.baudrate, ecu.can_id),
        Protocol::Iso9141 => open_bridge_channel(device),
    }
}

/// Open every bus of a platform, in table order. The `ecu_id` selects
/// the ISO-TP flow-control target on UDS buses.
pub fn open_all_channels(
    device: &Device,
    platform: CarPlatform,
    ecu_id: u8,
) -> Result<Vec<Channel>> {
    let conf = platform_config(platform);
    let mut channels = Vec::with_capacity(conf.buses.len());
    for bus in &conf.buses {
        let can_id = bus
            .ecus
            .iter()
            .find(|e| e.ecu_id == ecu_id)
            .map(|e| e.can_id)
            .unwrap_or(0);
        let channel = match bus.protocol {
            Protocol::Can => {
                let flags = if bus.can_id_bits == 29 {
                    adapter::FLAG_CAN_29BIT_ID
                } else {
                    0
                };
                open_can_channel(device, flags, bus.baudrate)?
            }
            Protocol::CanXonXoff | Protocol::CanPs => {
                open_low_speed_channel(device, adapter::FLAG_CAN_ID_BOTH)?
            }
            Protocol::IsoTp => open_isotp_channel(device, bus.baudrate, can_id)?,
            Protocol::Iso9141 => open_bridge_channel(device)?,
        };
        channels.push(channel);
    }
    // 250 kbps platforms additionally need the K-line bridge running.
    if conf.buses.iter().any(|b| b.baudrate == 250_000) {
        match open_bridge_channel(device) {
            Ok(c) => channels.push(c),
            Err(e) => warn!("bridge channel unavailable: {e}"),
        }
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vin_detection() {
        assert_eq!(platform_from_vin("YV1LS5547W1234567"), Some(CarPlatform::P80));
        assert_eq!(platform_from_vin("YV1MS382462345678"), Some(CarPlatform::P1));
        assert_eq!(platform_from_vin("YV1TS94D011234567"), Some(CarPlatform::P2));
        assert_eq!(platform_from_vin("WVWZZZ3CZ8E123456"), None);
    }

    #[test]
    fn platform_parse() -> crate::Result<()> {
        assert_eq!(CarPlatform::parse("p2")?, CarPlatform::P2);
        assert_eq!(CarPlatform::parse("P3")?, CarPlatform::P3);
        assert!(CarPlatform::parse("P99").is_err());
        Ok(())
    }

    #[test]
    fn ecu_lookup() -> crate::Result<()> {
        let (bus, ecu) = ecu_info(CarPlatform::P3, 0x10)?;
        assert_eq!(bus.protocol, Protocol::IsoTp);
        assert_eq!(ecu.can_id, 0x7E0);
        assert_eq!(channel_index_for_ecu(CarPlatform::P2, 0x50)?, 1);
        assert!(ecu_info(CarPlatform::Vag, 0x7A).is_err());
        Ok(())
    }
}
