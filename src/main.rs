use clap::Parser;
use clearway::config::{BrowserLaunchConfig, HeadlessMode};
use clearway::flow::FlowConfig;
use clearway::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Log level: trace|debug|info|warn|error
    #[arg(long, default_value = "info")]
    log: String,

    /// Local proxy address for browser and mailbox traffic
    #[arg(long)]
    proxies: Option<String>,

    /// Headless mode: new|true|false
    #[arg(long, default_value = "new")]
    headless: HeadlessMode,

    /// Disable GPU acceleration
    #[arg(long)]
    disable_gpu: bool,

    /// Browser executable path (system Chrome when omitted)
    #[arg(long)]
    chrome_path: Option<PathBuf>,

    /// Profile directory (unique temp dir per session when omitted)
    #[arg(long)]
    user_data_dir: Option<PathBuf>,

    /// Directory extensions are unpacked into
    #[arg(long, default_value = "tmp/extension-plugins")]
    extension_root: PathBuf,

    /// Hosts that bypass the proxy
    #[arg(long)]
    proxy_bypass: Vec<String>,

    /// Pass --no-sandbox to the browser (CI / container workaround)
    #[arg(long)]
    no_sandbox: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log)).init();

    if args.no_sandbox {
        log::warn!("running browser with --no-sandbox");
    }
    let browser = BrowserLaunchConfig {
        headless: args.headless,
        disable_gpu: args.disable_gpu,
        proxy: args.proxies,
        proxy_bypass: args.proxy_bypass,
        user_data_dir: args.user_data_dir,
        chrome_path: args.chrome_path,
        extension_root: args.extension_root,
        no_sandbox: args.no_sandbox,
        ..BrowserLaunchConfig::default()
    };

    let state = Arc::new(AppState {
        browser,
        flow: FlowConfig::default(),
    });

    log::info!("starting clearway on port {}", args.port);
    server::serve(args.port, state).await
}
