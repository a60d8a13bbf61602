/*! Log live ECU measurement values to a CSV file.

```no_run
$ canlog -f P2 -e 7A -i me7-params.csv -o run1.csv
```

The parameter sheet format is described in `candiag::params`; the
output file carries one row per 50 ms sample.
*/
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use candiag::adapter::{Device, LoopbackDriver};
use candiag::config::CarPlatform;
use candiag::logger::{Logger, LoggerCallback};
use candiag::params::LogParameters;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(short = 'd', long, default_value = "loopback", help = "Device name")]
    device: String,

    #[arg(short = 'b', long, default_value_t = 500_000, help = "CAN bus speed")]
    baudrate: u32,

    #[arg(short = 'f', long, default_value = "P2", help = "Car platform")]
    platform: String,

    #[arg(short = 'e', long, default_value = "7A", help = "ECU id (hex)")]
    ecu: String,

    #[arg(short = 'i', long, help = "Parameter sheet (CSV)")]
    input: PathBuf,

    #[arg(short = 'o', long, help = "Output log (CSV)")]
    output: PathBuf,

    #[arg(short = 't', long, help = "Stop after this many seconds")]
    seconds: Option<u64>,

    #[arg(short = 'v', action = clap::ArgAction::Count, help = "Increase verbosity")]
    verbose: u8,
}

/// Writes one CSV row per record, the header row up front.
struct CsvLogWriter {
    out: Mutex<BufWriter<File>>,
}

impl CsvLogWriter {
    fn create(path: &PathBuf, parameters: &LogParameters) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "Time (sec),")?;
        for param in parameters.parameters() {
            write!(out, "{}({}),", param.name(), param.unit())?;
        }
        writeln!(out)?;
        Ok(Self { out: Mutex::new(out) })
    }
}

impl LoggerCallback for CsvLogWriter {
    fn on_status_changed(&self, started: bool) {
        eprintln!("logging {}", if started { "started" } else { "stopped" });
    }

    fn on_record(&self, timestamp_ms: u64, values: &[f64]) {
        let mut out = self.out.lock().unwrap();
        let _ = write!(out, "{},", timestamp_ms as f64 / 1000.0);
        for value in values {
            let _ = write!(out, "{value},");
        }
        let _ = writeln!(out);
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("candiag")
        .verbosity(usize::from(opt.verbose))
        .init()?;

    let platform = CarPlatform::parse(&opt.platform)?;
    let ecu_id = {
        let digits = opt.ecu.trim_start_matches("0x").trim_start_matches("0X");
        u8::from_str_radix(digits, 16).with_context(|| format!("bad ECU id {:?}", opt.ecu))?
    };
    let device = match opt.device.as_str() {
        "loopback" => Device::open(&opt.device, Arc::new(LoopbackDriver::new())),
        other => bail!(
            "no pass-through driver for {other:?} in this build; \
             implement candiag::adapter::PassThru for your hardware"
        ),
    };

    let parameters = LogParameters::from_csv(
        File::open(&opt.input).with_context(|| format!("opening {}", opt.input.display()))?,
    )?;
    if parameters.parameters().is_empty() {
        bail!("parameter sheet {} is empty", opt.input.display());
    }

    let writer = Arc::new(CsvLogWriter::create(&opt.output, &parameters)?);
    let mut logger = Logger::new(device, platform, ecu_id)?;
    logger.register_callback(writer);
    logger.start(parameters)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }
    let deadline = opt.seconds.map(|s| std::time::Instant::now() + Duration::from_secs(s));
    while !stop.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    logger.stop();
    Ok(())
}
