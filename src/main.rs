use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::exit;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{CommandFactory, Parser};

use tfd128::{LoggerParameters, Measurement, ModeFlags, RetrievalPlan, Tfd128};

/// Device paths probed when --device is not given.
const DEVICE_CANDIDATES: &[&str] = &[
    "/dev/tfd128",            // Linux, preferred
    "/dev/tty.usbserial-3B1", // Mac OS X
    "/dev/ttyUSB0",           // Linux, fallback
];

#[derive(Parser, Debug)]
#[command(
    name = "tfd128",
    about = "Read and control a TFD 128 temperature/humidity data logger"
)]
struct Args {
    /// Serial device to communicate with
    #[arg(short, long)]
    device: Option<String>,

    /// Start a measurement (needs --mode and --interval)
    #[arg(short = 'S', long)]
    start: bool,

    /// Measurement interval in minutes
    #[arg(short, long, value_parser = clap::value_parser!(u8), value_name = "1|5")]
    interval: Option<u8>,

    /// Measurement mode: t, tf, ft, th or ht ('f' = Feuchte = humidity)
    #[arg(short, long)]
    mode: Option<String>,

    /// Stop the running measurement (no-op when the logger is idle)
    #[arg(short = 'E', long)]
    stop: bool,

    /// Print whether the logger is IDLE or BUSY
    #[arg(short, long)]
    status: bool,

    /// Print the firmware version
    #[arg(short = 'v', long)]
    dump_version: bool,

    /// Print the number of collected data points
    #[arg(short = 'a', long)]
    dump_count: bool,

    /// Print the data record info
    #[arg(short = 'z', long)]
    dump_info: bool,

    /// Print the data points to ./tfd128-<date>.csv as CSV
    #[arg(short = 'r', long)]
    dump_values: bool,

    /// Modify the destination of -r; "-" = stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Time format; see strftime() for values
    #[arg(long, default_value = "%d.%m.%Y %H:%M:%S")]
    time_fmt: String,

    /// Output line format: %c counter, %d date, %t temperature,
    /// %h humidity, %p literal percent
    #[arg(long)]
    data_fmt: Option<String>,
}

fn main() {
    tfd128::init_logging();
    match run() {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    let mut device = args.device.clone();
    if device.is_none() {
        for &candidate in DEVICE_CANDIDATES {
            if Path::new(candidate).exists() {
                device = Some(candidate.to_string());
                break;
            }
        }
    }
    let Some(device) = device else {
        eprintln!("No serial TFD 128 device found");
        return Ok(1);
    };

    let mut logger = Tfd128::open(&device)?;

    // While a logging session is running, only 'stop' and 'status' are
    // meaningful; everything else would be answered with NAK anyway.
    let busy = logger.is_busy()?;
    if busy && !args.stop && !args.status {
        eprintln!("logger is busy");
        return Ok(1);
    }

    if args.start {
        let (Some(mode), Some(interval)) = (args.mode.as_deref(), args.interval) else {
            eprintln!("--start needs both --mode and --interval");
            return Ok(1);
        };
        return cmd_start(&mut logger, interval, mode);
    }
    if args.stop {
        // Failsafe: when no logging is active, just ignore the call so that
        // stopping always succeeds.
        if busy {
            logger.stop()?;
        }
        return Ok(0);
    }
    if args.dump_version {
        println!("{}", logger.version()?);
        return Ok(0);
    }
    if args.dump_count {
        println!("{}", logger.params()?.count);
        return Ok(0);
    }
    if args.dump_info {
        return cmd_info(&mut logger, &args.time_fmt);
    }
    if args.dump_values {
        return cmd_values(&mut logger, &args);
    }
    if args.status {
        if busy {
            println!("BUSY");
            return Ok(1);
        }
        println!("IDLE");
        return Ok(0);
    }

    Args::command().print_help()?;
    Ok(1)
}

fn cmd_start(logger: &mut Tfd128, interval: u8, mode_str: &str) -> Result<i32> {
    let mut mode = ModeFlags::from_bits(0)?;
    if mode_str.contains('t') {
        mode = mode | ModeFlags::TEMPERATURE;
    }
    // The 'f' is a concession to german users.
    if mode_str.contains('f') || mode_str.contains('h') {
        mode = mode | ModeFlags::HUMIDITY;
    }
    logger.start(interval, mode)?;
    Ok(0)
}

fn cmd_info(logger: &mut Tfd128, time_fmt: &str) -> Result<i32> {
    let params = logger.params()?;
    let stop = match params.stop {
        Some(ts) => format_time(ts, time_fmt),
        None => "<no time recorded>".to_string(),
    };
    let mode = if params.mode.contains(ModeFlags::HUMIDITY) {
        "temperature+humidity"
    } else {
        "temperature"
    };
    println!("Start : {}", format_time(params.start, time_fmt));
    println!("Stop  : {stop}");
    println!("Mode  : {mode}");
    println!("Intvl : {} min", params.interval);
    println!("Count : {}", params.count);
    Ok(0)
}

fn cmd_values(logger: &mut Tfd128, args: &Args) -> Result<i32> {
    let params = logger.params()?;
    let has_humidity = params.mode.contains(ModeFlags::HUMIDITY);

    let mut output: Box<dyn Write> = match args.output.as_deref() {
        Some("-") => Box::new(std::io::stdout()),
        chosen => {
            let filename = match chosen {
                Some(name) => name.to_string(),
                None => {
                    let name = default_filename(&params);
                    println!("Data will be written to file '{name}'");
                    name
                }
            };
            if Path::new(&filename).exists() {
                eprintln!("'{filename}' already exists");
                return Ok(1);
            }
            Box::new(File::create(&filename).with_context(|| format!("creating {filename}"))?)
        }
    };

    let data_fmt = match args.data_fmt.clone() {
        Some(fmt) => fmt,
        None if has_humidity => "%c;%d;%t;%h".to_string(),
        None => "%c;%d;%t".to_string(),
    };

    let mut counter = 0usize;
    for block in logger.blocks() {
        for point in block? {
            let line = render_line(&data_fmt, counter, &point, &args.time_fmt);
            writeln!(output, "{line}")?;
            counter += 1;
        }
    }
    Ok(0)
}

/// CSV file name derived from the corrected stop time of the recording.
fn default_filename(params: &LoggerParameters) -> String {
    let stop = RetrievalPlan::new(params).stop;
    format!("tfd128-{}.csv", format_time(stop, "%Y%m%d"))
}

fn format_time(ts: i64, fmt: &str) -> String {
    match Local.timestamp_opt(ts, 0).earliest() {
        Some(dt) => dt.format(fmt).to_string(),
        None => ts.to_string(),
    }
}

fn render_line(fmt: &str, counter: usize, point: &Measurement, time_fmt: &str) -> String {
    let mut line = fmt.to_string();
    line = line.replace("%c", &counter.to_string());
    line = line.replace("%d", &format_time(point.timestamp, time_fmt));
    line = line.replace("%t", &format!("{:4.1}", point.temperature));
    if let Some(h) = point.humidity {
        line = line.replace("%h", &h.to_string());
    }
    line.replace("%p", "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_line_substitutes_every_token() {
        let point = Measurement {
            timestamp: 0,
            temperature: 21.5,
            humidity: Some(55),
        };
        let line = render_line("%c;%t;%h%p", 3, &point, "%Y");
        assert_eq!(line, "3;21.5;55%");
    }

    #[test]
    fn render_line_keeps_the_humidity_token_without_a_value() {
        let point = Measurement {
            timestamp: 0,
            temperature: -0.5,
            humidity: None,
        };
        let line = render_line("%t;%h", 0, &point, "%Y");
        assert_eq!(line, "-0.5;%h");
    }
}
