mod auth;
mod cloudcode;
mod config;
mod error;
mod format;
mod gateway;
mod models;
mod server;

#[cfg(test)]
mod testutil;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::CredentialManager;
use cloudcode::CloudCodeClient;
use config::{Config, ConfigError};
use gateway::GatewayDispatcher;
use server::ServerState;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("{RED}Failed to install rustls crypto provider{RESET}");
        std::process::exit(1);
    }

    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "login" => {
                init_logging_foreground(false);
                let config = load_config(None, None, false);
                if let Err(e) = run_login(config).await {
                    eprintln!("{RED}Login failed:{RESET} {}", e);
                    if let Some(suggestion) = e.suggestion() {
                        eprintln!();
                        eprintln!("  {YELLOW}Tip:{RESET} {}", suggestion);
                    }
                    std::process::exit(1);
                }
                return;
            }
            "models" => {
                print_models();
                return;
            }
            "-h" | "--help" | "help" => {
                print_help();
                return;
            }
            "-V" | "--version" | "version" => {
                println!("cagw {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "serve" => {}
            arg if !arg.starts_with('-') => {
                eprintln!("{RED}Unknown command:{RESET} {}", arg);
                eprintln!();
                eprintln!("Run '{YELLOW}cagw --help{RESET}' for usage information.");
                std::process::exit(1);
            }
            _ => {} // Options like --port, --debug are handled below
        }
    }

    let mut port: Option<u16> = None;
    let mut host: Option<String> = None;
    let mut debug = false;

    let start = if args.get(1).is_some_and(|a| a == "serve") { 2 } else { 1 };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match args.get(i).map(|v| v.parse::<u16>()) {
                    Some(Ok(p)) if p > 0 => port = Some(p),
                    Some(_) => {
                        eprintln!(
                            "{RED}Invalid port:{RESET} '{}' is not a valid port number (1-65535)",
                            args[i]
                        );
                        std::process::exit(1);
                    }
                    None => {
                        eprintln!("{RED}Missing value:{RESET} --port requires a port number");
                        std::process::exit(1);
                    }
                }
            }
            "--host" => {
                i += 1;
                match args.get(i) {
                    Some(h) => host = Some(h.clone()),
                    None => {
                        eprintln!(
                            "{RED}Missing value:{RESET} --host requires a hostname or IP address"
                        );
                        std::process::exit(1);
                    }
                }
            }
            "--debug" | "-d" => debug = true,
            other => {
                eprintln!("{RED}Unknown option:{RESET} {}", other);
                eprintln!();
                eprintln!("Run '{YELLOW}cagw --help{RESET}' for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let config = load_config(port, host, debug);
    init_logging_foreground(config.logging.debug);
    run_server().await;
}

/// File config, then environment, then command-line flags.
fn load_config(port: Option<u16>, host: Option<String>, debug: bool) -> Config {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{RED}Configuration error:{RESET} {}", e);
            if let ConfigError::ParseError { .. } = e {
                eprintln!();
                eprintln!("  {DIM}Fix the syntax error and try again.{RESET}");
            }
            std::process::exit(1);
        }
    };
    let config = config.with_env().with_overrides(port, host, debug);
    config::init_config(config.clone());
    config
}

fn build_credentials(config: &Config) -> (Arc<CredentialManager>, Arc<CloudCodeClient>) {
    let api = Arc::new(CloudCodeClient::new(&config.cloudcode));
    let credentials = Arc::new(CredentialManager::new(
        &config.auth,
        &config.cloudcode,
        api.clone(),
    ));
    (credentials, api)
}

async fn run_login(config: Config) -> error::Result<()> {
    let (credentials, _) = build_credentials(&config);
    credentials.login().await?;
    let context = credentials.ensure_ready(false).await?;

    println!();
    println!("{GREEN}●{RESET} Logged in");
    println!(
        "  {DIM}Credentials:{RESET} {}",
        credentials.credential_file().display()
    );
    println!("  {DIM}Project:{RESET}     {}", context.project_id);
    println!();
    Ok(())
}

async fn run_server() {
    let config = config::get_config();
    let (credentials, api) = build_credentials(&config);

    // Stored credentials are checked eagerly but a failure is not fatal; the
    // first request retries. Without any, the browser flow runs now.
    if credentials.has_stored_credentials() {
        match credentials.ensure_ready(false).await {
            Ok(context) => info!(project_id = %context.project_id, "Credentials ready"),
            Err(e) => warn!(error = %e, "Credential check failed, will retry on request"),
        }
    } else {
        info!("No stored credentials, starting browser sign-in");
        if let Err(e) = credentials.ensure_ready(true).await {
            error!(error = %e, "Sign-in failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("  {YELLOW}Tip:{RESET} {}", suggestion);
            }
            std::process::exit(1);
        }
    }

    info!(
        endpoint = api.endpoint(),
        onboarded = credentials.is_onboarded(),
        "Cloud Code client ready"
    );

    let log_requests = config.logging.log_requests;
    let state = Arc::new(ServerState {
        gateway: GatewayDispatcher::new(credentials, api, log_requests),
        api_key: config.server.api_key.clone().filter(|k| !k.is_empty()),
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        log_requests,
    });
    if state.api_key.is_none() {
        warn!("No GEMINI_AUTH_PASSWORD set, every route is unauthenticated");
    }

    let addr: SocketAddr = match format!("{}:{}", config.host(), config.port()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = config.host(), port = config.port(), error = %e, "Invalid listen address");
            std::process::exit(1);
        }
    };

    info!(address = %addr, "Starting cagw gateway");
    if let Err(e) = run_server_with_shutdown(addr, state).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

fn init_logging_foreground(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cagw=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cagw=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run_server_with_shutdown(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");
    print_listening_address(addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = result?;
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "Connection error");
                    }
                });
            }
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_listening_address(addr: SocketAddr) {
    let shown = if addr.ip().is_unspecified() {
        format!("http://localhost:{}", addr.port())
    } else {
        format!("http://{}", addr)
    };
    println!();
    println!("  {GREEN}●{RESET} cagw listening on {BOLD}{shown}{RESET}");
    println!("    {DIM}OpenAI:{RESET} {shown}/v1/chat/completions");
    println!("    {DIM}Gemini:{RESET} {shown}/v1beta/models/<model>:generateContent");
    println!();
}

fn print_models() {
    println!();
    println!("{BOLD}MODELS{RESET}");
    for model in models::all_models() {
        println!(
            "  {YELLOW}{:<48}{RESET} {DIM}{}{RESET}",
            model.name, model.display_name
        );
    }
    println!();
}

fn print_help() {
    println!(
        r#"
{BOLD}cagw{RESET} {DIM}OpenAI and Gemini gateway for Google Cloud Code Assist{RESET}

{BOLD}USAGE:{RESET}  {GREEN}cagw{RESET} [COMMAND] [OPTIONS]

{BOLD}COMMANDS{RESET}
┌─────────┬────────────────────────────────────────┐
│ {YELLOW}serve{RESET}   │ Run the gateway {DIM}(default){RESET}               │
│ {YELLOW}login{RESET}   │ Authenticate with Google OAuth         │
│ {YELLOW}models{RESET}  │ List the model catalog                 │
│ {YELLOW}version{RESET} │ Show version information               │
│ {YELLOW}help{RESET}    │ Show this help message                 │
└─────────┴────────────────────────────────────────┘

{BOLD}OPTIONS{RESET}
┌──────────────────────┬───────────────────────────────────┐
│ {YELLOW}-p{RESET}, {YELLOW}--port{RESET} <PORT>    │ Server port {DIM}(default: 8888){RESET}       │
│ {YELLOW}--host{RESET} <HOST>        │ Bind address {DIM}(default: 127.0.0.1){RESET} │
│ {YELLOW}-d{RESET}, {YELLOW}--debug{RESET}          │ Enable debug logging              │
│ {YELLOW}-h{RESET}, {YELLOW}--help{RESET}           │ Show this help message            │
│ {YELLOW}-V{RESET}, {YELLOW}--version{RESET}        │ Show version information          │
└──────────────────────┴───────────────────────────────────┘

{BOLD}ENVIRONMENT{RESET}
  {YELLOW}GEMINI_AUTH_PASSWORD{RESET}            Password required on inbound requests
  {YELLOW}GEMINI_CREDENTIALS{RESET}              OAuth credential JSON
  {YELLOW}GOOGLE_APPLICATION_CREDENTIALS{RESET}  Credential file path
  {YELLOW}GOOGLE_CLOUD_PROJECT{RESET}            Project id override
  {YELLOW}PORT{RESET}, {YELLOW}HOST{RESET}                      Listen address

{BOLD}EXAMPLES{RESET}
  {GREEN}cagw login{RESET}              {DIM}# First-time sign-in{RESET}
  {GREEN}cagw{RESET}                    {DIM}# Start the gateway{RESET}
  {GREEN}cagw --port 3000 -d{RESET}     {DIM}# Custom port with debug logging{RESET}

{DIM}Config: {}{RESET}
"#,
        Config::path().display()
    );
}
