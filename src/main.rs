use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use servobus::servo::network::Network;
use servobus::servo::protocol::port_handler::{PortHandler, SimPort, TracePort};
use servobus::servo::protocol::registers::{Register, REGISTERS};
use servobus::servo::protocol::serial_port::{resolve_port, SerialPortHandler};
use servobus::servo::protocol::servo_def::MAX_ID;
use servobus::servo::sim::ServoBusSim;

type BoxResult<T> = Result<T, Box<dyn std::error::Error>>;
type Bus = Network<Box<dyn PortHandler>>;

#[derive(Debug, Parser)]
#[command(name = "servobus", about = "Smart servo bus client")]
struct Args {
    #[arg(
        long,
        value_name = "PORT",
        help = "Serial port path (e.g. COM6 or /dev/ttyUSB0). If omitted, auto-selects a detected port."
    )]
    port: Option<String>,

    #[arg(long, default_value_t = 1_000_000)]
    baud: u32,

    /// Status packet read timeout.
    #[arg(long, default_value_t = 50)]
    timeout_ms: u64,

    /// Log protocol details (debug level).
    #[arg(long, short)]
    verbose: bool,

    /// Log every byte sent and received.
    #[arg(long)]
    trace_bytes: bool,

    /// Talk to N emulated servos (ids 1..=N) instead of a serial port.
    #[arg(long, value_name = "N")]
    simulate: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ping a range of addresses and list the servos that answer.
    Scan {
        #[arg(long, default_value_t = 0)]
        low: u8,

        #[arg(long, default_value_t = MAX_ID)]
        high: u8,
    },

    /// Read one register.
    Read {
        #[arg(long)]
        id: u8,

        #[arg(long, value_parser = parse_register)]
        register: Register,
    },

    /// Write one register.
    Write {
        #[arg(long)]
        id: u8,

        #[arg(long, value_parser = parse_register)]
        register: Register,

        #[arg(long)]
        value: u16,
    },

    /// Set goal position (and optionally speed) and synchronize.
    Move {
        #[arg(long)]
        id: u8,

        #[arg(long, value_name = "0..1023")]
        position: u16,

        #[arg(long)]
        speed: Option<u16>,
    },

    /// Hold every servo at its present position.
    Stop,

    /// Change a servo's address.
    SetId {
        #[arg(long)]
        id: u8,

        #[arg(long)]
        new_id: u8,
    },

    /// Print every register of one servo.
    Dump {
        #[arg(long)]
        id: u8,
    },

    /// Scan the bus and print protocol counters.
    Diagnostics,
}

fn parse_register(value: &str) -> Result<Register, String> {
    if let Ok(address) = value.parse::<u8>() {
        return Register::from_address(address).ok_or_else(|| format!("no register at address {address}"));
    }
    Register::from_name(value).ok_or_else(|| format!("unknown register '{value}'"))
}

fn open_bus(args: &Args) -> BoxResult<Bus> {
    let port: Box<dyn PortHandler> = match args.simulate {
        Some(count) => {
            println!("Simulating {count} servo(s)");
            let mut sim_port = SimPort::new(ServoBusSim::with_servos(1..=count));
            sim_port.set_motion(true);
            Box::new(sim_port)
        }
        None => {
            let (port_name, auto_selected) = resolve_port(args.port.clone(), args.baud)?;
            if auto_selected {
                println!("Auto-selected serial port: {port_name}");
            }
            let timeout = Duration::from_millis(args.timeout_ms);
            let mut serial = SerialPortHandler::open(&port_name, args.baud, timeout)?;
            serial.clear_port()?;
            Box::new(serial)
        }
    };
    let port: Box<dyn PortHandler> = if args.trace_bytes {
        Box::new(TracePort::new(port))
    } else {
        port
    };

    let mut network = Network::from_port(port);
    network.set_read_timeout(Duration::from_millis(args.timeout_ms))?;
    Ok(network)
}

fn find_servo(network: &mut Bus, id: u8) -> BoxResult<()> {
    let found = network.scan(id, id)?;
    if found.is_empty() {
        return Err(format!("no servo answered at address {id}").into());
    }
    Ok(())
}

fn run_scan(network: &mut Bus, low: u8, high: u8) -> BoxResult<()> {
    let found = network.scan(low, high)?;
    for id in &found {
        let Some(mut servo) = network.servo(*id) else {
            continue;
        };
        let model = servo.model_number()?;
        let firmware = servo.firmware_version()?;
        println!(
            "id={id} model={model} firmware={firmware} goal={} speed={}",
            servo.goal_position(),
            servo.moving_speed()
        );
    }
    println!("Found {} servo(s)", found.len());
    Ok(())
}

fn run_read(network: &mut Bus, id: u8, register: Register) -> BoxResult<()> {
    find_servo(network, id)?;
    let mut servo = network.servo(id).ok_or("servo disappeared")?;
    let value = servo.read(register)?;
    println!("id={id} {register}={value}");
    Ok(())
}

fn run_write(network: &mut Bus, id: u8, register: Register, value: u16) -> BoxResult<()> {
    find_servo(network, id)?;
    let mut servo = network.servo(id).ok_or("servo disappeared")?;
    servo.write(register, value)?;
    network.synchronize()?;
    println!("id={id} {register}<-{value}");
    Ok(())
}

fn run_move(network: &mut Bus, id: u8, position: u16, speed: Option<u16>) -> BoxResult<()> {
    find_servo(network, id)?;
    let mut servo = network.servo(id).ok_or("servo disappeared")?;
    if let Some(speed) = speed {
        servo.set_moving_speed(speed)?;
    }
    servo.set_goal_position(position)?;
    network.synchronize()?;

    let mut servo = network.servo(id).ok_or("servo disappeared")?;
    println!(
        "id={id} goal={} speed={} present={} moving={}",
        servo.goal_position(),
        servo.moving_speed(),
        servo.present_position()?,
        servo.is_moving()?
    );
    Ok(())
}

fn run_stop(network: &mut Bus) -> BoxResult<()> {
    let found = network.scan(0, MAX_ID)?;
    network.set_stopped(true)?;
    println!("Stopped {} servo(s)", found.len());
    Ok(())
}

fn run_set_id(network: &mut Bus, id: u8, new_id: u8) -> BoxResult<()> {
    network.scan(0, MAX_ID)?;
    network.set_address(id, new_id)?;
    println!("id={id} -> id={new_id}");
    Ok(())
}

fn run_dump(network: &mut Bus, id: u8) -> BoxResult<()> {
    find_servo(network, id)?;
    let first = REGISTERS.first().map(|info| info.register).ok_or("empty register table")?;
    let last = REGISTERS.last().map(|info| info.register).ok_or("empty register table")?;

    let mut servo = network.servo(id).ok_or("servo disappeared")?;
    for (register, value) in servo.read_span(first, last)? {
        let access = if register.is_read_only() { "r " } else { "rw" };
        println!("{:3} {access} {:<26} {value}", register.address(), register.name());
    }
    Ok(())
}

fn run_diagnostics(network: &mut Bus) -> BoxResult<()> {
    let found = network.scan(0, MAX_ID)?;
    let diagnostics = network.diagnostics();
    println!("servos found:        {}", found.len());
    println!("packets sent:        {}", diagnostics.packets_sent);
    println!("packets received:    {}", diagnostics.packets_received);
    println!("framing errors:      {}", diagnostics.framing_errors);
    println!("extra header bytes:  {}", diagnostics.extra_header_bytes);
    println!("discarded packets:   {}", diagnostics.discarded_packets);
    println!("checksum mismatches: {}", diagnostics.checksum_mismatches);
    println!("device errors:       {}", diagnostics.device_errors);
    println!("timeouts:            {}", diagnostics.timeouts);
    println!("average read time:   {:?}", diagnostics.average_read_time);
    println!("max read time:       {:?}", diagnostics.max_read_time);
    Ok(())
}

fn main() -> BoxResult<()> {
    let args = Args::parse();

    let level = if args.trace_bytes {
        LevelFilter::Trace
    } else if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .without_timestamps()
        .init()?;

    let mut network = open_bus(&args)?;

    match args.command {
        Command::Scan { low, high } => run_scan(&mut network, low, high),
        Command::Read { id, register } => run_read(&mut network, id, register),
        Command::Write { id, register, value } => run_write(&mut network, id, register, value),
        Command::Move { id, position, speed } => run_move(&mut network, id, position, speed),
        Command::Stop => run_stop(&mut network),
        Command::SetId { id, new_id } => run_set_id(&mut network, id, new_id),
        Command::Dump { id } => run_dump(&mut network, id),
        Command::Diagnostics => run_diagnostics(&mut network),
    }
}
