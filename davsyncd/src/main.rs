use std::sync::Arc;

use davsyncd::daemon::{self, DaemonConfig, DaemonRuntime};
use davsyncd::storage::KeyringSecretStore;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Validate,
    FindLibraries,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--validate" => mode = CliMode::Validate,
            "--find-libraries" => mode = CliMode::FindLibraries,
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: davsyncd [--once | --validate | --find-libraries | --logout]");
        println!("  --once             Run a single sync and exit");
        println!("  --validate         Check the server connection and exit");
        println!("  --find-libraries   List libraries found on the server");
        println!("  --logout           Remove the stored password and exit");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    if mode == CliMode::Logout {
        if daemon::logout(&config, Arc::new(KeyringSecretStore::default()))? {
            info!("stored password removed");
        } else {
            info!(sync_root = %config.sync_root.display(), "no synchronizer configured");
        }
        return Ok(());
    }

    let runtime = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => {
            let report = runtime.run_once().await?;
            if !report.success() {
                anyhow::bail!("sync finished with {} failure(s)", report.failures);
            }
            Ok(())
        }
        CliMode::Validate => {
            if !runtime.validate().await {
                anyhow::bail!("server connection could not be verified");
            }
            println!("connection ok");
            Ok(())
        }
        CliMode::FindLibraries => {
            for library in runtime.find_libraries().await? {
                match library.uid {
                    Some(uid) => println!("{}\t{}\t{}", library.path, library.name, uid),
                    None => println!("{}\t{}", library.path, library.name),
                }
            }
            Ok(())
        }
        _ => runtime.run().await,
    }
}
