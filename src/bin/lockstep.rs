use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lockstep::bus::{BrokerServer, Connection, Inbound, MemoryBroker};
use lockstep::component::ComponentService;
use lockstep::config::{BusConfig, BusTransport, ComponentConfig, DummyConfig, ManagerConfig};
use lockstep::dummy::DummyComponent;
use lockstep::manager::{RunOutcome, SimulationManager};
use lockstep::protocol::{Decoded, Message};
use lockstep::recorder::{MessageLog, ALL_TOPICS};

const DEFAULT_LISTEN: &str = "127.0.0.1:7650";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("lockstep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("⏱️  Lockstep - epoch-synchronized simulation over publish/subscribe")
        .arg(
            Arg::with_name("bus")
                .short("b")
                .long("bus")
                .value_name("ADDRESS")
                .help("Broker address (overrides BUS_ADDRESS)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("exchange")
                .short("e")
                .long("exchange")
                .value_name("NAME")
                .help("Exchange name (overrides BUS_EXCHANGE)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("broker")
                .about("🌐 Run the TCP message broker")
                .arg(
                    Arg::with_name("listen")
                        .short("l")
                        .long("listen")
                        .value_name("ADDRESS")
                        .help("Address to listen on")
                        .takes_value(true)
                        .default_value(DEFAULT_LISTEN),
                ),
        )
        .subcommand(
            SubCommand::with_name("manager")
                .about("🎛️  Run the Simulation Manager")
                .long_about("Runs the coordinator configured from SIMULATION_* environment variables")
                .arg(
                    Arg::with_name("components")
                        .short("c")
                        .long("components")
                        .value_name("NAMES")
                        .help("Comma separated component names (overrides SIMULATION_COMPONENTS)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max-epochs")
                        .short("n")
                        .long("max-epochs")
                        .value_name("COUNT")
                        .help("Maximum number of epochs, 0 for unbounded")
                        .takes_value(true)
                        .validator(|value| match value.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Epoch count must be a non-negative number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("component")
                .about("🧩 Run a dummy simulation component")
                .long_about("Runs the reference participant configured from the environment"),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("👀 Print every message seen on the bus")
                .arg(
                    Arg::with_name("pattern")
                        .help("Topic pattern")
                        .default_value(ALL_TOPICS),
                ),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("🚀 Run a manager and dummy components in one process")
                .arg(
                    Arg::with_name("components")
                        .short("c")
                        .long("components")
                        .value_name("COUNT")
                        .help("Number of dummy components")
                        .takes_value(true)
                        .default_value("3"),
                )
                .arg(
                    Arg::with_name("epochs")
                        .short("n")
                        .long("epochs")
                        .value_name("COUNT")
                        .help("Number of epochs")
                        .takes_value(true)
                        .default_value("5"),
                )
                .arg(
                    Arg::with_name("error-chance")
                        .long("error-chance")
                        .value_name("PROBABILITY")
                        .help("Per-epoch failure probability of each component")
                        .takes_value(true)
                        .default_value("0"),
                ),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    init_logging(verbose);
    let format = matches.value_of("format").unwrap_or("table");

    let mut bus = BusConfig::from_env()?;
    if let Some(address) = matches.value_of("bus") {
        bus.transport = BusTransport::Tcp {
            address: address.to_string(),
        };
    }
    if let Some(exchange) = matches.value_of("exchange") {
        bus.exchange = exchange.to_string();
    }

    match matches.subcommand() {
        ("broker", Some(sub_matches)) => handle_broker(sub_matches).await,
        ("manager", Some(sub_matches)) => handle_manager(sub_matches, bus, format).await,
        ("component", Some(_)) => handle_component(bus).await,
        ("watch", Some(sub_matches)) => handle_watch(sub_matches, bus, format).await,
        ("demo", Some(sub_matches)) => handle_demo(sub_matches, bus, format).await,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Run everything in one process", "lockstep demo".bright_cyan());
            println!("  {} Start a broker for separate processes", "lockstep broker".bright_cyan());
            println!("  {} Follow the messages on a broker", "lockstep watch".bright_cyan());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancels the returned token on Ctrl+C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

fn warn_if_in_process(bus: &BusConfig) {
    if bus.transport == BusTransport::Memory {
        warn!("BUS_ADDRESS is not set; only participants in this process are reachable");
    }
}

async fn handle_broker(matches: &ArgMatches<'_>) -> Result<()> {
    let address = matches.value_of("listen").unwrap_or(DEFAULT_LISTEN);
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("cannot listen on {}", address))?;
    println!("{} Broker listening on {} (Press Ctrl+C to stop)", "🌐".bright_blue(), address.bright_cyan());

    let server = BrokerServer::new(MemoryBroker::new());
    server.serve(listener, ctrl_c_token()).await?;
    let stats = server.broker().stats();
    info!("Broker stopped: {:?}", stats);
    Ok(())
}

async fn handle_manager(matches: &ArgMatches<'_>, bus: BusConfig, format: &str) -> Result<()> {
    let mut config = ManagerConfig::from_env()?;
    config.bus = bus;
    if let Some(components) = matches.value_of("components") {
        config.components = components
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(max_epochs) = matches.value_of("max-epochs") {
        config.max_epochs = match max_epochs.parse::<u64>()? {
            0 => None,
            max => Some(max),
        };
    }
    if config.components.is_empty() {
        bail!("no components given; set SIMULATION_COMPONENTS or pass --components");
    }
    warn_if_in_process(&config.bus);

    let connection = Connection::open(&config.bus).await?;
    let manager = SimulationManager::new(&config, &connection);
    let interrupt = manager.interrupt_handle();
    let ctrl_c = ctrl_c_token();
    tokio::spawn(async move {
        ctrl_c.cancelled().await;
        interrupt.cancel();
    });

    let outcome = manager.run().await?;
    connection.close().await;
    print_outcome(&outcome, format)?;
    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_component(bus: BusConfig) -> Result<()> {
    let mut config = ComponentConfig::from_env()?;
    config.bus = bus;
    let dummy = DummyConfig::from_env()?;
    warn_if_in_process(&config.bus);

    let connection = Connection::open(&config.bus).await?;
    let service = ComponentService::new(&config, &connection, DummyComponent::new(dummy));
    let interrupt = service.interrupt_handle();
    let ctrl_c = ctrl_c_token();
    tokio::spawn(async move {
        ctrl_c.cancelled().await;
        interrupt.cancel();
    });

    let state = service.run().await?;
    connection.close().await;
    println!("{} Component '{}' finished in state {:?}", "🧩".bright_blue(), config.component_name.bright_white(), state);
    Ok(())
}

async fn handle_watch(matches: &ArgMatches<'_>, bus: BusConfig, format: &str) -> Result<()> {
    let pattern = matches.value_of("pattern").unwrap_or(ALL_TOPICS);
    warn_if_in_process(&bus);

    let connection = Connection::open(&bus).await?;
    let client = connection.client(bus.exchange.as_str());
    let mut subscription = client.subscribe(&[pattern]).await?;
    println!(
        "{} Watching '{}' on exchange '{}' (Press Ctrl+C to stop)",
        "👀".bright_blue(),
        pattern.bright_cyan(),
        bus.exchange
    );

    let stop = ctrl_c_token();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            inbound = subscription.next() => match inbound {
                Some(inbound) => print_inbound(&inbound, format),
                None => {
                    println!("{}", "Bus connection lost".bright_red());
                    break;
                }
            },
        }
    }
    client.close().await;
    connection.close().await;
    Ok(())
}

async fn handle_demo(matches: &ArgMatches<'_>, bus: BusConfig, format: &str) -> Result<()> {
    let count: usize = matches.value_of("components").unwrap_or("3").parse().context("invalid component count")?;
    let epochs: u64 = matches.value_of("epochs").unwrap_or("5").parse().context("invalid epoch count")?;
    let error_chance: f64 = matches
        .value_of("error-chance")
        .unwrap_or("0")
        .parse()
        .context("invalid error chance")?;
    if !(0.0..=1.0).contains(&error_chance) {
        bail!("--error-chance must be between 0 and 1");
    }

    let connection = Connection::in_memory(&MemoryBroker::new());
    let log = MessageLog::new();
    let recorder = connection.client(bus.exchange.as_str());
    log.attach(&recorder, &[ALL_TOPICS]).await?;

    let names: Vec<String> = (1..=count).map(|index| format!("dummy-{}", index)).collect();
    let manager_config = ManagerConfig {
        components: names.clone(),
        max_epochs: Some(epochs),
        start_delay: Duration::from_millis(200),
        bus: bus.clone(),
        ..ManagerConfig::default()
    };

    let dummy = DummyConfig {
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        error_chance,
        ..DummyConfig::default()
    };
    let mut participants = Vec::new();
    for name in &names {
        let config = ComponentConfig {
            simulation_id: manager_config.simulation_id.clone(),
            component_name: name.clone(),
            bus: bus.clone(),
            ..ComponentConfig::default()
        };
        let service = ComponentService::new(&config, &connection, DummyComponent::new(dummy.clone()));
        participants.push(tokio::spawn(service.run()));
    }

    let manager = SimulationManager::new(&manager_config, &connection);
    let interrupt = manager.interrupt_handle();
    let ctrl_c = ctrl_c_token();
    tokio::spawn(async move {
        ctrl_c.cancelled().await;
        interrupt.cancel();
    });
    let outcome = manager.run().await?;

    for participant in participants {
        match tokio::time::timeout(Duration::from_secs(5), participant).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(error))) => warn!("Component ended with an error: {}", error),
            Ok(Err(error)) => warn!("Component task failed: {}", error),
            Err(_) => warn!("Component did not stop in time"),
        }
    }
    recorder.close().await;

    print_outcome(&outcome, format)?;
    if format == "table" {
        println!(
            "{} {} messages recorded, {} invalid",
            "📼".bright_blue(),
            log.len(),
            log.invalid().len()
        );
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(outcome)?),
        "compact" => println!(
            "{} {} epochs={} failed={} timeouts={}",
            outcome.simulation_id,
            outcome.reason,
            outcome.epochs_completed,
            outcome.failed_components.len(),
            outcome.timeouts.len()
        ),
        _ => {
            println!("\n{}", "🏁 Simulation Outcome".bright_blue().bold());
            println!("{}", "════════════════════".bright_blue());
            println!("{} {}", "Simulation:".bright_white(), outcome.simulation_id);
            let reason = outcome.reason.to_string();
            if outcome.is_success() {
                println!("{} {}", "Result:".bright_white(), reason.bright_green());
            } else {
                println!("{} {}", "Result:".bright_white(), reason.bright_red());
            }
            println!("{} {}", "Epochs completed:".bright_white(), outcome.epochs_completed);
            for failure in &outcome.failed_components {
                println!(
                    "{} {} failed in epoch {}: {}",
                    "❌".red(),
                    failure.component.bright_white(),
                    failure.epoch,
                    failure.description.as_deref().unwrap_or("no description")
                );
            }
            for timeout in &outcome.timeouts {
                println!(
                    "{} epoch {} timed out waiting for {}",
                    "⏰".yellow(),
                    timeout.epoch,
                    timeout.components.join(", ").bright_white()
                );
            }
        }
    }
    Ok(())
}

fn print_inbound(inbound: &Inbound, format: &str) {
    match (&inbound.decoded, format) {
        (Decoded::Message(message), "json") => match serde_json::to_string(message) {
            Ok(json) => println!("{}", json),
            Err(error) => println!("{} {}", "❌".red(), error),
        },
        (Decoded::Message(message), "compact") => println!(
            "{} {} {}",
            inbound.topic,
            message.message_type(),
            message.message_id().unwrap_or("-")
        ),
        (Decoded::Message(message), _) => print_message(&inbound.topic, message),
        (Decoded::Invalid(invalid), _) => println!(
            "{} {} {} ({})",
            "⚠️".yellow(),
            inbound.topic.bright_white(),
            invalid.reason().bright_red(),
            invalid.payload_text()
        ),
    }
}

fn print_message(topic: &str, message: &Message) {
    let epoch = message
        .epoch_number()
        .map_or_else(|| "-".to_string(), |epoch| epoch.to_string());
    let detail = match message {
        Message::SimState(state) => format!("{:?}", state.simulation_state()).bright_cyan().to_string(),
        Message::Epoch(epoch) => format!(
            "{} .. {}",
            lockstep::protocol::timestamp::format(&epoch.start_time()),
            lockstep::protocol::timestamp::format(&epoch.end_time())
        ),
        Message::Status(status) => match status.description() {
            Some(description) => format!("{:?}: {}", status.value(), description).bright_red().to_string(),
            None => format!("{:?}", status.value()).bright_green().to_string(),
        },
        Message::General(_) => String::new(),
    };
    println!(
        "{} {} {} epoch={} {}",
        topic.bright_white(),
        message.message_type().bright_blue(),
        message.source_process_id().unwrap_or("-").dimmed(),
        epoch,
        detail
    );
}
