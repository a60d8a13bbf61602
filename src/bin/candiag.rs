/*! Flash, read, wake up and PIN-scan ECUs from the command line.

```no_run
$ candiag -f P3 -e 10 -p D35D6F flash -i firmware.vbf -s sbl.vbf
$ candiag -f P2 -e 7A read -o dump.bin -s 0x8000 --size 0x70000
$ candiag -f P2 wakeup
$ candiag -f P3 -e 10 pin
```

The pass-through driver is pluggable; this build ships only the
in-memory loopback driver (`-d loopback`), real J2534/SocketCAN
backends implement `candiag::adapter::PassThru` and slot in here.
*/
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Timelike;
use clap::Parser;

use candiag::adapter::{Device, LoopbackDriver};
use candiag::config::{self, CarPlatform};
use candiag::flasher::{
    FixedSbl, FlashKind, Flasher, FlasherCallback, FlasherParameters, FlasherState, NoSbl,
    SblProvider,
};
use candiag::pinfinder::{Direction, PinFinder, PinFinderState};
use candiag::security::pin_array;
use candiag::{d2, uds_steps, vbf};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(short = 'd', long, default_value = "loopback", help = "Device name")]
    device: String,

    #[arg(short = 'b', long, default_value_t = 500_000, help = "CAN bus speed")]
    baudrate: u32,

    #[arg(
        short = 'f',
        long,
        default_value = "P2",
        help = "Car platform: P80, P1, P2, P2_250, P3, SPA, FORD, VAG, HAVAL"
    )]
    platform: String,

    #[arg(short = 'e', long, default_value = "7A", help = "ECU id (hex)")]
    ecu: String,

    #[arg(short = 'p', long, default_value = "0", help = "PIN to unlock the ECU (hex)")]
    pin: String,

    #[arg(short = 'v', action = clap::ArgAction::Count, help = "Increase verbosity")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Flash a VBF or BIN to an ECU.
    Flash {
        #[arg(short = 'i', long, help = "File to flash")]
        input: PathBuf,
        #[arg(short = 's', long, help = "Secondary bootloader VBF")]
        sbl: Option<PathBuf>,
    },
    /// Read flash memory out of an ECU.
    Read {
        #[arg(short = 'o', long, help = "File to write")]
        output: PathBuf,
        #[arg(short = 's', long, help = "Start address (hex)")]
        start: String,
        #[arg(long = "size", visible_alias = "sz", help = "Byte count (hex)")]
        size: String,
    },
    /// Wake the CAN network up.
    Wakeup,
    /// Brute-force the security-access PIN.
    Pin {
        #[arg(short = 'd', long, help = "Scan downward from the start PIN")]
        down: bool,
    },
    /// Exercise the stack against the loopback driver.
    Test,
}

fn parse_hex_u32(input: &str) -> Result<u32> {
    let digits = input.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("bad hex value {input:?}"))
}

fn parse_hex_u64(input: &str) -> Result<u64> {
    let digits = input.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("bad hex value {input:?}"))
}

fn open_device(name: &str) -> Result<Device> {
    match name {
        "loopback" => Ok(Device::open(name, Arc::new(LoopbackDriver::new()))),
        other => bail!(
            "no pass-through driver for {other:?} in this build; \
             implement candiag::adapter::PassThru for your hardware"
        ),
    }
}

fn load_artifact(platform: CarPlatform, ecu_id: u8, path: &Path) -> Result<vbf::Vbf> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("vbf")) {
        Ok(vbf::parse(&bytes)?)
    } else {
        Ok(vbf::from_binary(platform, ecu_id, "", bytes)?)
    }
}

struct ConsoleProgress;

impl FlasherCallback for ConsoleProgress {
    fn on_state(&self, state: FlasherState) {
        println!("state: {state:?}");
    }
    fn on_progress(&self, current: usize, maximum: usize) {
        if maximum > 0 {
            eprint!("\r{current}/{maximum} ({}%)  ", current * 100 / maximum);
        }
    }
}

fn run_flasher(device: Device, kind: FlashKind, params: FlasherParameters) -> Result<Flasher> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }
    let mut flasher = Flasher::new(device, kind, params);
    flasher.register_callback(Arc::new(ConsoleProgress));
    flasher.start()?;
    while !matches!(flasher.state(), FlasherState::Done | FlasherState::Error) {
        if stop.load(Ordering::SeqCst) {
            eprintln!("\nstopping...");
            flasher.stop();
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    flasher.join();
    eprintln!();
    if flasher.state() != FlasherState::Done {
        bail!("job finished in state {:?}", flasher.state());
    }
    Ok(flasher)
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("candiag")
        .verbosity(usize::from(opt.verbose))
        .init()?;

    let platform = CarPlatform::parse(&opt.platform)?;
    let ecu_id = parse_hex_u32(&opt.ecu)? as u8;
    let pin = parse_hex_u64(&opt.pin)?;
    let device = open_device(&opt.device)?;

    match opt.command {
        Command::Flash { input, sbl } => {
            let flash = load_artifact(platform, ecu_id, &input)?;
            let sbl_provider: Arc<dyn SblProvider> = match sbl {
                Some(path) => {
                    let bytes = fs::read(&path)?;
                    Arc::new(FixedSbl(vbf::parse(&bytes)?))
                }
                None => Arc::new(NoSbl),
            };
            let kind = match platform {
                CarPlatform::Vag => FlashKind::KwpFlash,
                CarPlatform::P3 | CarPlatform::Spa | CarPlatform::Ford | CarPlatform::Haval => {
                    FlashKind::UdsFlash
                }
                _ => FlashKind::D2Flash,
            };
            let now = chrono::Local::now();
            run_flasher(
                device,
                kind,
                FlasherParameters {
                    platform,
                    ecu_id,
                    pin: pin_array(pin),
                    extra_info: String::new(),
                    clock: Some((now.hour() as u8, now.minute() as u8)),
                    flash,
                    sbl_provider,
                },
            )?;
            println!("flash complete");
        }
        Command::Read { output, start, size } => {
            let start = parse_hex_u32(&start)?;
            let size = parse_hex_u32(&size)?;
            let flasher = run_flasher(
                device,
                FlashKind::D2Read { start, size },
                FlasherParameters {
                    platform,
                    ecu_id,
                    pin: pin_array(pin),
                    extra_info: String::new(),
                    clock: None,
                    flash: vbf::Vbf::default(),
                    sbl_provider: Arc::new(NoSbl),
                },
            )?;
            let data = flasher.read_data().context("no data read")?;
            fs::write(&output, &data)?;
            println!("wrote {} bytes to {}", data.len(), output.display());
        }
        Command::Wakeup => {
            let channels = config::open_all_channels(&device, platform, ecu_id)?;
            match platform {
                CarPlatform::P3
                | CarPlatform::Spa
                | CarPlatform::Ford
                | CarPlatform::Haval
                | CarPlatform::Vag => uds_steps::wake_up(&channels),
                _ => candiag::d2_steps::wake_up(&channels),
            }
            println!("wake-up sent");
        }
        Command::Pin { down } => {
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = Arc::clone(&stop);
                ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
            }
            let direction = if down { Direction::Down } else { Direction::Up };
            let mut finder = PinFinder::new(
                device,
                platform,
                ecu_id,
                direction,
                pin,
                Some(Arc::new(|state, current| {
                    if state == PinFinderState::Work {
                        eprint!("\rtrying {current:06X}  ");
                    }
                })),
            );
            finder.start()?;
            while !matches!(finder.state(), PinFinderState::Done | PinFinderState::Error) {
                if stop.load(Ordering::SeqCst) {
                    finder.stop();
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            finder.join();
            eprintln!();
            match finder.found_pin() {
                Some(found) => println!("PIN found: {found:06X}"),
                None => bail!("no PIN found"),
            }
        }
        Command::Test => {
            let channels = config::open_all_channels(&device, platform, ecu_id)?;
            let vin_request = d2::messages::request_vin();
            for channel in &channels {
                channel.send(&vin_request, 1000)?;
                let frames = channel.read(16, 1000)?;
                println!("{} frame(s) echoed", frames.len());
            }
        }
    }
    Ok(())
}
