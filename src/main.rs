use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use slog_scope::{info, warn};
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::runtime::Runtime;
use zwilling::configuration::Config;
use zwilling::process_control::spawn_workers;
use zwilling::{logging, SpawnerFactory};

/// Spawns workers for an application and keeps them around until
/// interrupted.
#[derive(StructOpt, Debug)]
#[structopt(name = "zwilling")]
struct Opt {
    /// Path to the configuration file.
    #[structopt(short = "f", long, default_value = "./zwilling.toml")]
    config_file: PathBuf,

    /// Name of the application to spawn workers for. Defaults to the
    /// first configured application.
    #[structopt(short, long)]
    app: Option<String>,

    /// How many workers to spawn.
    #[structopt(short = "n", long, default_value = "1")]
    count: usize,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let config = Config::load(&opt.config_file)?;
    let log = logging::root_logger(&config.log);
    let _guard = slog_scope::set_global_logger(log);

    let app = match &opt.app {
        Some(name) => config
            .app(name)
            .ok_or_else(|| anyhow!("Application {:?} is not configured", name))?,
        None => config
            .apps
            .first()
            .ok_or_else(|| anyhow!("No applications are configured"))?,
    };
    info!("startup"; "app" => &app.name, "count" => opt.count);

    let rt = Runtime::new()?;
    rt.block_on(async {
        let factory = SpawnerFactory::new();
        let spawner = factory.get_spawner(app)?;

        let mut handles = spawn_workers(spawner.as_ref(), opt.count, app.spawn_timeout)
            .await
            .with_context(|| format!("Could not spawn workers for {:?}", app.name))?;
        for handle in handles.iter() {
            println!("{}", handle.summary());
        }

        tokio::signal::ctrl_c()
            .await
            .context("Could not wait for Ctrl-C")?;
        info!("shutting down");
        for handle in handles.iter_mut() {
            handle.terminate();
        }
        join_all(handles.iter_mut().map(|handle| async move {
            if handle.is_alive() {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                if handle.is_alive() {
                    warn!("worker did not exit, killing it"; "pid" => handle.pid().as_raw());
                    handle.kill();
                }
            }
        }))
        .await;
        factory.shutdown().await;
        Ok(())
    })
}
