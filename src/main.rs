use std::{io::BufRead, process::ExitCode, sync::Arc, thread};

use clap::{Parser, Subcommand, ValueEnum};
use futures::{StreamExt, executor::block_on};

use vless_client::{
    AppContext, ConnectionEvent, ConnectionOrchestrator, EngineConfig, ServerConfig, Settings,
};

#[derive(Parser)]
#[command(name = "vless-client", version, about = "VLESS proxy client")]
#[command(args_conflicts_with_subcommands = true, arg_required_else_help = true)]
struct Cli {
    /// A vless:// link handed over by a browser or launcher
    link: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List saved servers
    List,
    /// Import a vless:// URI
    Add { uri: String },
    /// Remove a saved server
    Delete { id: String },
    /// Select the server used by `connect`
    Use { id: String },
    /// Connect to the active server and hold the tunnel until Enter is pressed
    Connect {
        #[arg(long)]
        no_smart_connect: bool,
    },
    /// Print the engine configuration for a server (default: the active one)
    Render { id: Option<String> },
    /// Turn automatic failover on or off
    SmartConnect { mode: Toggle },
}

#[derive(ValueEnum, Clone, Copy)]
enum Toggle {
    On,
    Off,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("vless_client=info"),
    )
    .init();

    log::info!(
        "vless-client v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let cli = Cli::parse();
    let settings = Settings::load();

    match block_on(run(cli, settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("[startup] {error}");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let mut context = AppContext::bootstrap(settings).await?;

    if let Some(link) = cli.link {
        let server = context.handle_link(&link).await?;
        println!("Imported {} ({})", server.label(), server.id);
        return Ok(());
    }

    let Some(command) = cli.command else {
        return Ok(());
    };

    match command {
        Command::List => print_servers(&context),
        Command::Add { uri } => {
            let server = context.store.add(&uri).await?;
            println!("Added {} ({})", server.label(), server.id);
        }
        Command::Delete { id } => {
            context.store.delete(&id).await?;
            println!("Deleted {id}");
        }
        Command::Use { id } => {
            context.store.set_active(&id).await?;
            println!("Active server is now {id}");
        }
        Command::Render { id } => {
            let server = match id {
                Some(id) => context.store.get(&id),
                None => context.store.active(),
            }
            .ok_or("no such server")?;
            let rendered =
                EngineConfig::from(&server).to_xray_json(&context.settings.render_options())?;
            println!("{rendered}");
        }
        Command::SmartConnect { mode } => {
            context.set_smart_connect(matches!(mode, Toggle::On));
            context.settings.save()?;
            println!(
                "Smart connect {}",
                if context.settings.smart_connect { "on" } else { "off" }
            );
        }
        Command::Connect { no_smart_connect } => {
            if no_smart_connect {
                context.orchestrator.set_auto_failover(false);
            }
            hold_connection(&context).await?;
        }
    }
    Ok(())
}

fn print_servers(context: &AppContext) {
    let servers = context.store.list();
    if servers.is_empty() {
        println!("No servers saved. Add one with `vless-client add <uri>`.");
        return;
    }
    let active_id = context.store.active_id();
    for server in servers.iter() {
        let marker = if active_id.as_deref() == Some(server.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {}  {}  {}  {}/{}",
            server.id,
            server.label(),
            server.endpoint(),
            server.transport,
            server.security,
        );
    }
}

async fn hold_connection(context: &AppContext) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = context.orchestrator.clone();
    spawn_watchers(&orchestrator, context.store.list().as_ref().clone());

    let state = orchestrator.connect().await?;
    if !state.is_connected() {
        println!("Connection ended in state {state}");
        return Ok(());
    }

    println!(
        "Connected. SOCKS proxy on 127.0.0.1:{}. Press Enter to disconnect.",
        context.settings.socks_port
    );
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    orchestrator.disconnect().await;
    println!("Disconnected");
    Ok(())
}

fn spawn_watchers(orchestrator: &Arc<ConnectionOrchestrator>, servers: Vec<ServerConfig>) {
    let watcher = orchestrator.clone();
    thread::spawn(move || block_on(watcher.watch_engine()));

    let mut events = orchestrator.subscribe();
    thread::spawn(move || {
        block_on(async move {
            let name_of = |id: &str| {
                servers
                    .iter()
                    .find(|server| server.id == id)
                    .map(|server| server.label())
                    .unwrap_or_else(|| id.to_string())
            };
            while let Some(event) = events.next().await {
                match event {
                    ConnectionEvent::StateChanged {
                        state,
                        server_id: Some(id),
                    } => println!("[{state}] {}", name_of(&id)),
                    ConnectionEvent::StateChanged { state, .. } => println!("[{state}]"),
                    ConnectionEvent::AttemptFailed { server_id, reason } => {
                        println!("  {} failed: {reason}", name_of(&server_id))
                    }
                    ConnectionEvent::IpChanged(Some(ip)) => println!("  external address {ip}"),
                    ConnectionEvent::IpChanged(None) => {}
                }
            }
        })
    });
}
