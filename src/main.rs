use clap::{Parser, Subcommand};
use netstack::config;
use netstack::link::ChannelEndpoint;
use netstack::protocol::{Ipv4Protocol, UdpProtocol};
use netstack::stack::{LinkCapabilities, Protocols, Stack};
use netstack::telemetry::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Outbound frames buffered per channel link before writes fail.
const LINK_QUEUE_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "netstack")]
#[command(about = "A userspace network stack core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Build a stack from config and run it until interrupted
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config { action }) => {
            init_logging(None);
            match action {
                ConfigAction::Generate {
                    config: config_path,
                    output,
                } => cmd_config_generate(&config_path, &output),
                ConfigAction::Validate {
                    config: config_path,
                } => cmd_config_validate(&config_path),
            }
        }
        Some(Commands::Run { config: config_path }) => cmd_run(&config_path),
        None => cmd_run(&PathBuf::from("config.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;
    init_logging(cfg.logging.as_ref());
    info!("Loaded {}", config_path.display());

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        debug!("{}", warning);
    }
    if validation.has_errors() {
        validation.print_diagnostics();
        return Err("Validation failed".to_string());
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let protocols = Protocols::new()
            .with_network(Arc::new(Ipv4Protocol::new()))
            .with_transport(Arc::new(UdpProtocol::new()));
        let stack = Stack::new(config::stack_options(&cfg, protocols))
            .map_err(|e| format!("Failed to create stack: {}", e))?;

        for nic_cfg in &cfg.nics {
            let plan = config::nic_plan(nic_cfg).map_err(|e| format!("nic {}: {}", nic_cfg.id, e))?;
            let caps = if plan.loopback {
                LinkCapabilities::LOOPBACK
            } else {
                LinkCapabilities::empty()
            };
            let (link, mut outbound) =
                ChannelEndpoint::new(LINK_QUEUE_DEPTH, plan.mtu, plan.link_address, caps);
            let link = link.with_pool(Arc::clone(stack.pool()));
            stack
                .create_nic(plan.id, Arc::new(link), plan.options.clone())
                .map_err(|e| format!("nic {}: {}", plan.id, e))?;
            for addr in &plan.addresses {
                stack
                    .add_address(plan.id, *addr)
                    .map_err(|e| format!("nic {}: {}: {}", plan.id, addr.address, e))?;
            }

            let nic = plan.id;
            tokio::spawn(async move {
                while let Some(pkt) = outbound.recv().await {
                    trace!(nic, remote = %pkt.route.remote_address, len = pkt.data.len(), "outbound");
                }
            });
        }

        let routes = config::route_entries(&cfg).map_err(|e| e.to_string())?;
        info!("Installing {} routes", routes.len());
        stack.set_route_table(routes);

        for (id, table) in config::build_tables(&cfg.iptables).map_err(|e| e.to_string())? {
            stack
                .replace_table(id, table, cfg.iptables.ipv6)
                .map_err(|e| format!("table {}: {}", id, e))?;
            info!("Installed {} table", id);
        }

        let (period, buckets) = config::maintenance_schedule(&cfg);
        let maintenance = stack.spawn_maintenance(period, buckets);

        info!(nics = cfg.nics.len(), "Stack started");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to wait for ctrl-c: {}", e))?;

        maintenance.abort();
        for (name, value) in stack.export_stats() {
            info!("{} = {}", name, value);
        }
        info!("Stack stopped");
        Ok(())
    })
}

fn cmd_config_generate(config_path: &PathBuf, output_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Loading {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let lock = config::generate_lock(&cfg);

    let lock_toml =
        toml::to_string_pretty(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;

    let output = format!(
        "# Generated by netstack - DO NOT EDIT\n# Source: {}\n\n{}",
        config_path.display(),
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    println!("[INFO] Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
