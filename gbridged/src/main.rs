use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{App, Arg, ArgMatches};

use gbridged::bridge::{self, Core};
use gbridged::controller::Controller;
use gbridged::controllers::gbsim::GbsimController;
use gbridged::controllers::tcpip::TcpIpController;
use gbridged::controllers::uart::UartController;
use gbridged::logging;
use gbridged::netlink::NetlinkTransport;
use gbridged::svc;

fn main() {
    let matches = App::new("gbridged")
        .about("Bridge between a Greybus host and remote Greybus modules")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("serial device of a module (e.g. /dev/ttyUSB0)"),
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .takes_value(true)
                .default_value("115200")
                .help("baud rate of the serial device"),
        )
        .arg(
            Arg::with_name("manifest")
                .short("m")
                .long("manifest")
                .takes_value(true)
                .help("manifest file of a simulated module"),
        )
        .arg(
            Arg::with_name("no-tcpip")
                .long("no-tcpip")
                .help("disable mDNS discovery of TCP/IP modules"),
        )
        .arg(
            Arg::with_name("bluetooth")
                .long("bluetooth")
                .help("scan for Bluetooth RFCOMM modules"),
        )
        .arg(
            Arg::with_name("disable-watchdog")
                .long("disable-watchdog")
                .help("turn the host kernel's SVC watchdog off"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("raise log verbosity (twice for frame dumps)"),
        )
        .get_matches();

    logging::setup(matches.occurrences_of("verbose"));

    if let Err(e) = run(&matches) {
        log::error!("{:#}", e);
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let core = Core::new();

    {
        let core = core.clone();
        ctrlc::set_handler(move || core.request_shutdown())
            .context("failed to install signal handler")?;
    }

    svc::register_driver(&core).context("failed to register the svc driver")?;

    let netlink = NetlinkTransport::new().context("failed to init netlink")?;
    core.set_host(netlink.clone());

    start_controllers(&core, matches);

    let recv_thread = netlink
        .start(&core)
        .context("failed to start the netlink receiver")?;

    svc::init(&core).context("failed to init svc")?;

    if matches.is_present("disable-watchdog") {
        svc::watchdog_disable();
    }

    log::info!("bridge is up");
    let _ = recv_thread.join();

    // The receive loop also ends on a socket error; make sure every other
    // thread sees the shutdown either way.
    core.request_shutdown();
    bridge::controllers_exit(&core);
    log::info!("clean shutdown");
    Ok(())
}

/// Bring up every controller the command line asks for. A controller
/// failing to initialize is dropped; the others keep running.
fn start_controllers(core: &Arc<Core>, matches: &ArgMatches) {
    let mut wanted: Vec<Box<dyn Controller>> = Vec::new();

    if let Some(device) = matches.value_of("port") {
        match matches.value_of("baudrate").unwrap_or("115200").parse() {
            Ok(baudrate) => wanted.push(Box::new(UartController::new(device, baudrate))),
            Err(_) => log::error!("ignoring serial port: bad baud rate"),
        }
    }

    if let Some(manifest) = matches.value_of("manifest") {
        wanted.push(Box::new(GbsimController::new(manifest)));
    }

    if !matches.is_present("no-tcpip") {
        wanted.push(Box::new(TcpIpController::new()));
    }

    if matches.is_present("bluetooth") {
        add_bluetooth(&mut wanted);
    }

    for imp in wanted {
        let handle = match bridge::register_controller(core, imp) {
            Ok(handle) => handle,
            Err(_) => continue,
        };
        if let Err(e) = bridge::start_controller(core, &handle) {
            log::error!("failed to start {}: {}", handle.name(), e);
        }
    }
}

#[cfg(feature = "bluetooth")]
fn add_bluetooth(wanted: &mut Vec<Box<dyn Controller>>) {
    use gbridged::controllers::bluetooth::BluetoothController;
    wanted.push(Box::new(BluetoothController::new()));
}

#[cfg(not(feature = "bluetooth"))]
fn add_bluetooth(_wanted: &mut Vec<Box<dyn Controller>>) {
    log::error!("bluetooth support has not been compiled in");
}
