use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rai_connect_core::control::StartError;
use rai_connect_core::hosts::HostsError;
use rai_connect_core::trust::{self, TrustError};
use rai_connect_core::{Controller, LogBuffer, LogCaptureLayer, ProxyConfig};

/// Clean stop.
const EXIT_OK: u8 = 0;
/// Permission denied on the port, the trust store or the hosts file.
const EXIT_PERMISSION: u8 = 2;
/// Certificate generation failed.
const EXIT_CERT: u8 = 3;
/// Anything else.
const EXIT_INTERNAL: u8 = 4;

#[derive(Parser)]
#[command(name = "rai-connect")]
#[command(about = "rai!connect - local HTTPS interception proxy for the osu! client")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rai-connect.yaml")]
    config: PathBuf,

    /// Log file directory (enables file logging)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy until interrupted
    Run,
    /// Generate a default configuration file
    Init,
    /// Validate the configuration file
    Validate,
    /// Generate the certificate (if needed) and install it into the system trust store
    InstallCert,
    /// Remove the certificate from the system trust store
    UninstallCert,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_buffer = LogBuffer::new();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "rai_connect=info,info".into());
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogCaptureLayer::new(log_buffer.clone()));

    let _guard = if let Some(ref log_dir) = cli.log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "rai-connect.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let code = match cli.command {
        Commands::Run => runtime.block_on(cmd_run(&cli.config, log_buffer)),
        Commands::Init => exit_from_result(cmd_init(&cli.config)),
        Commands::Validate => exit_from_result(cmd_validate(&cli.config)),
        Commands::InstallCert => cmd_install_cert(),
        Commands::UninstallCert => cmd_uninstall_cert(),
    };
    ExitCode::from(code)
}

fn load_config(path: &PathBuf) -> Result<ProxyConfig> {
    if path.exists() {
        ProxyConfig::load(path)
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Ok(ProxyConfig::default())
    }
}

async fn cmd_run(config_path: &PathBuf, log_buffer: LogBuffer) -> u8 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "invalid configuration");
            return EXIT_INTERNAL;
        }
    };

    tracing::info!(
        port = config.https_port,
        official = %config.official_base_host,
        inject_supporter = config.inject_supporter,
        "starting rai!connect"
    );

    let controller = Controller::new(log_buffer);
    if let Err(e) = controller.start(config).await {
        tracing::error!(error = %e, "failed to start proxy");
        return start_error_code(&e);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for shutdown signal");
        controller.stop().await;
        return EXIT_INTERNAL;
    }
    tracing::info!("shutdown signal received");

    controller.stop().await;
    EXIT_OK
}

fn cmd_init(config_path: &PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }

    let yaml = serde_yaml::to_string(&ProxyConfig::default())?;
    std::fs::write(config_path, yaml)?;
    println!("Default config written to {}", config_path.display());
    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    let config = ProxyConfig::load(config_path)?;
    println!("Configuration is valid.");
    println!("  Listen: {}", config.bind_addr());
    println!("  Official host: {}", config.official_base_host);
    println!("  Mirror API: {}", config.mirror_api_base_url);
    println!("  Mirror direct: {}", config.mirror_direct_base_url);
    println!("  Inject supporter: {}", config.inject_supporter);
    println!("  Aliases: {}", config.hosts_aliases().len());
    Ok(())
}

fn cmd_install_cert() -> u8 {
    let result = trust::data_dir().and_then(|dir| {
        let domains = ProxyConfig::default().certificate_domains();
        let bundle = trust::ensure(&dir, &domains)?;
        trust::install_to_system_trust(&bundle).map(|outcome| (bundle, outcome))
    });

    match result {
        Ok((bundle, trust::InstallOutcome::Installed)) => {
            println!("Certificate installed (SHA-1 {}).", bundle.fingerprint);
            EXIT_OK
        }
        Ok((bundle, trust::InstallOutcome::AlreadyPresent)) => {
            println!("Certificate already installed (SHA-1 {}).", bundle.fingerprint);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Certificate install failed: {}", e);
            trust_error_code(&e)
        }
    }
}

fn cmd_uninstall_cert() -> u8 {
    let result = trust::data_dir().and_then(|dir| trust::load(&dir));
    match result {
        Ok(None) => {
            println!("No certificate on disk; nothing to uninstall.");
            EXIT_OK
        }
        Ok(Some(bundle)) => match trust::uninstall_from_system_trust(&bundle) {
            Ok(()) => {
                println!("Certificate removed from the system trust store.");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("Certificate removal failed: {}", e);
                trust_error_code(&e)
            }
        },
        Err(e) => {
            eprintln!("Could not load certificate: {}", e);
            trust_error_code(&e)
        }
    }
}

fn exit_from_result(result: Result<()>) -> u8 {
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("{}", e);
            EXIT_INTERNAL
        }
    }
}

fn start_error_code(e: &StartError) -> u8 {
    match e {
        StartError::Trust(trust) => trust_error_code(trust),
        StartError::Hosts(HostsError::PermissionDenied(_)) => EXIT_PERMISSION,
        StartError::Bind { source, .. }
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            EXIT_PERMISSION
        }
        _ => EXIT_INTERNAL,
    }
}

fn trust_error_code(e: &TrustError) -> u8 {
    match e {
        TrustError::PermissionDenied(_) => EXIT_PERMISSION,
        TrustError::Generation(_) | TrustError::DataDir => EXIT_CERT,
        _ => EXIT_INTERNAL,
    }
}
