use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aicard")]
#[command(about = "DingTalk AI card bot backed by Dify", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: AICARD_CONFIG_PATH or ~/.aicard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Connect to DingTalk in Stream mode and answer messages with streaming AI cards. Ctrl+C stops.
    Run {
        /// Config file path (default: AICARD_CONFIG_PATH or ~/.aicard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Characters of growth between intermediate card updates (overrides config and env)
        #[arg(long, short, value_name = "N")]
        throttle: Option<usize>,
    },

    /// Print the resolved configuration with secrets masked.
    Check {
        /// Config file path (default: AICARD_CONFIG_PATH or ~/.aicard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("aicard {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, throttle }) => {
            if let Err(e) = run_relay(config, throttle).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_relay(config_path: Option<PathBuf>, throttle: Option<usize>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    if !path.exists() {
        log::warn!("no config file at {}, using defaults and environment", path.display());
    }
    let ctx = lib::context::AppContext::new(config)?;
    let mut settings = ctx.relay_settings()?;
    if let Some(t) = throttle {
        settings.throttle_chars = t;
    }
    log::info!(
        "starting relay for app {} (card template {}, throttle {} chars)",
        ctx.credentials.client_id,
        settings.template_id,
        settings.throttle_chars
    );
    let relay = ctx.relay(settings);
    let supervisor = ctx.supervisor(relay);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("ctrl+c received, shutting down"),
            Err(e) => log::error!("listening for ctrl+c: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await;
    log::info!("relay stopped");
    Ok(())
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    use lib::config;

    let (cfg, path) = config::load_config(config_path)?;
    let masked = |v: Option<String>| match v {
        Some(s) => config::mask_secret(&s),
        None => "(not set)".to_string(),
    };
    let plain = |v: Option<String>| v.unwrap_or_else(|| "(not set)".to_string());

    let file_state = if path.exists() { "found" } else { "missing, defaults used" };
    println!("config file:        {} ({})", path.display(), file_state);
    println!("dingtalk.clientId:  {}", plain(config::resolve_client_id(&cfg)));
    println!("dingtalk.secret:    {}", masked(config::resolve_client_secret(&cfg)));
    println!("dingtalk.robotCode: {}", plain(config::resolve_robot_code(&cfg)));
    println!("dingtalk.template:  {}", plain(config::resolve_card_template_id(&cfg)));
    println!("dingtalk.apiBase:   {}", cfg.dingtalk.api_base);
    println!("dingtalk.idle:      {}s", cfg.dingtalk.idle_timeout_secs);
    println!("upstream.baseUrl:   {}", plain(config::resolve_upstream_base_url(&cfg)));
    println!("upstream.apiKey:    {}", masked(config::resolve_upstream_api_key(&cfg)));
    println!("upstream.text:      {:?}", cfg.upstream.text_endpoint);
    println!("relay.throttle:     {}", config::resolve_throttle_chars(&cfg));
    println!(
        "relay.tempDir:      {}",
        cfg.relay
            .temp_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| std::env::temp_dir().display().to_string())
    );

    let mut problems = Vec::new();
    if let Err(e) = config::require_credentials(&cfg) {
        problems.push(e.to_string());
    }
    if config::resolve_card_template_id(&cfg).is_none() {
        problems.push("missing configuration: dingtalk.cardTemplateId".to_string());
    }
    if config::resolve_upstream_api_key(&cfg).is_none() || config::resolve_upstream_base_url(&cfg).is_none() {
        problems.push("upstream api key or base url not set".to_string());
    }
    if let Some(dir) = cfg.relay.temp_dir.as_ref().filter(|d| !d.is_dir()) {
        problems.push(format!("relay.tempDir {} is not a directory", dir.display()));
    }
    if problems.is_empty() {
        println!("ok: ready to run");
        return Ok(());
    }
    for p in &problems {
        println!("problem: {}", p);
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}
