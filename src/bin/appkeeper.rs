// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use tokio::runtime;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use appkeeper::{AppRegistry, Error, LocalHost, Settings, Supervisor};

const APPS: &str = "apps";
const SETTINGS: &str = "settings";
const NAME: &str = "name";

const STATUS: &str = "status";
const START: &str = "start";
const STOP: &str = "stop";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn app_name_arg(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn app_name_arg(self) -> Self {
        self.arg(
            Arg::new(NAME)
                .value_name("NAME")
                .required(true)
                .help("name of the application, as declared in the apps file"),
        )
    }
}

fn main() -> Result<(), Error> {
    let args = Command::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new(APPS)
                .short('a')
                .long(APPS)
                .value_name("FILE")
                .default_value("apps.yml")
                .help("the declared applications"),
        )
        .arg(
            Arg::new(SETTINGS)
                .short('s')
                .long(SETTINGS)
                .value_name("FILE")
                .default_value("appkeeper.yml")
                .help("supervisor settings, defaults are used if the file does not exist"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new(STATUS)
                .setup_clap_app()
                .about("show which applications are running"),
        )
        .subcommand(
            Command::new(START)
                .setup_clap_app()
                .about("start an application")
                .app_name_arg(),
        )
        .subcommand(
            Command::new(STOP)
                .setup_clap_app()
                .about("stop an application")
                .app_name_arg(),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: ArgMatches) -> Result<(), Error> {
    let settings_path = args
        .get_one::<String>(SETTINGS)
        .ok_or("settings path not specified")?;
    let apps_path = args
        .get_one::<String>(APPS)
        .ok_or("apps path not specified")?;

    let settings = Arc::new(Settings::load(settings_path).await?.prepare().await?);
    let (registry, rejected) = AppRegistry::load(apps_path).await?;
    for err in rejected {
        warn!("{}", err);
    }

    let host = Arc::new(LocalHost::new(settings.accelerator_usage));
    let supervisor = Supervisor::new(registry, Arc::clone(&settings), host);

    match args.subcommand() {
        Some((STATUS, _)) => status(&supervisor).await,
        Some((START, sub)) => {
            let name = app_name(sub)?;
            match supervisor.start(name, &CancellationToken::new()).await {
                Ok(process) => {
                    println!("{} running (pid {})", name, process.pid);
                    Ok(())
                }
                Err(e) if e.is_advisory() => {
                    println!("{}, check again with `{}`", e, STATUS);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Some((STOP, sub)) => {
            let name = app_name(sub)?;
            let stopped = supervisor.stop(name).await?;
            println!("{} stopped ({:?})", name, stopped);
            Ok(())
        }
        Some((other, _)) => Err(format!("unexpected command: {}", other).into()),
        None => Err("command required".into()),
    }
}

fn app_name(args: &ArgMatches) -> Result<&str, Error> {
    args.get_one::<String>(NAME)
        .map(String::as_str)
        .ok_or_else(|| Error::from("application name required"))
}

async fn status(supervisor: &Supervisor<LocalHost>) -> Result<(), Error> {
    let statuses = supervisor.refresh().await?;
    let memory = supervisor.snapshot().await.memory();
    println!(
        "RAM: {:.2} / {:.2} GB ({:.2} GB free)",
        memory.used_bytes as f64 / GIB,
        memory.total_bytes as f64 / GIB,
        memory.free_bytes() as f64 / GIB,
    );

    for (category, apps) in supervisor.registry().by_category() {
        println!("\n{}", category);
        for app in apps {
            let status = match statuses.get(&app.name) {
                Some(status) => status,
                None => continue,
            };

            match status.process {
                Some(ref process) => {
                    let mut usage = format!("RAM: {:.2}%", process.memory_percent);
                    if let Some(mib) = process.accelerator_mib {
                        usage.push_str(&format!(", GPU: {} MB", mib));
                    }
                    let links = app
                        .links(supervisor.settings())
                        .into_iter()
                        .map(|link| format!("[{}]({})", link.label, link.url))
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!(
                        "  {:<24} {:<8} pid {:<8} {} {}",
                        app.name, status.state, process.pid, usage, links
                    );
                }
                None => println!("  {:<24} {}", app.name, status.state),
            }
        }
    }

    Ok(())
}
