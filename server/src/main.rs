/*
 * Copyright 2024 Oxide Computer Company
 */

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use asyncbuild_common::*;
use dropshot::{ApiDescription, ConfigDropshot, HttpServerStarter};
use getopts::Options;
#[allow(unused_imports)]
use slog::{error, info, o, warn, Logger};

mod api;
mod config;
mod fs;
mod jobs;
mod paths;
mod remote;
mod runner;
mod store;
mod unix;

#[cfg(test)]
mod fake;

pub(crate) trait ApiResultEx {
    fn api_check(&self) -> Result<()>;
}

impl ApiResultEx for std::result::Result<(), dropshot::ApiDescriptionRegisterError> {
    fn api_check(&self) -> Result<()> {
        self.as_ref()
            .map_err(|e| anyhow!("API registration failure: {}", e))?;
        Ok(())
    }
}

pub(crate) struct Central {
    pub(crate) jobs: Arc<jobs::Jobs>,
}

/*
 * How long to wait at shutdown for cancelled jobs to clean up after
 * themselves.
 */
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Options::new();

    opts.optopt("b", "", "bind address:port", "BIND_ADDRESS");
    opts.optopt("f", "", "configuration file", "CONFIG");
    opts.optopt("S", "", "dump OpenAPI schema", "FILE");

    let p = match opts.parse(std::env::args().skip(1)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ERROR: usage: {}", e);
            eprintln!("       {}", opts.usage("usage"));
            exit(1);
        }
    };

    let mut ad = ApiDescription::new();
    ad.register(api::container::containers_get).api_check()?;
    ad.register(api::container::container_submit).api_check()?;
    ad.register(api::container::container_host_get).api_check()?;
    ad.register(api::container::container_host_delete).api_check()?;
    ad.register(api::container::container_get).api_check()?;
    ad.register(api::container::container_cancel).api_check()?;

    if let Some(s) = p.opt_str("S") {
        let mut f =
            std::fs::OpenOptions::new().create_new(true).write(true).open(s)?;
        ad.openapi("Async Build", dropshot::semver::Version::new(1, 0, 0)).write(&mut f)?;
        return Ok(());
    }

    let bind_address =
        p.opt_str("b").as_deref().unwrap_or("127.0.0.1:9980").parse()?;

    let config = if let Some(f) = p.opt_str("f").as_deref() {
        config::load(f)?
    } else {
        bail!("must specify configuration file (-f)");
    };

    let log = make_log("asyncbuild");

    info!(log, "build host is {}", config.async_agent;
        "max_jobs" => config.max_jobs,
        "port" => config.port);
    if let Some(ws) = config.workspace.as_deref() {
        info!(log, "scratch directories under {:?}", ws);
    } else {
        info!(log, "scratch directories in user home directories");
    }

    let env = runner::Env {
        host: config.async_agent.to_string(),
        fs: Arc::new(fs::LocalFs),
        remote: Arc::new(remote::SshExecutor::new(&config)),
        poll: config.poll_interval(),
        sync: config.sync_interval(),
    };

    let jobs = Arc::new(jobs::Jobs::new(
        log.new(o!("component" => "jobs")),
        &config,
        env,
        Arc::new(unix::NssUsers),
    ));

    let c = Arc::new(Central { jobs: Arc::clone(&jobs) });

    let server = HttpServerStarter::new(
        &ConfigDropshot { bind_address, ..Default::default() },
        ad,
        c,
        &log,
    )
    .map_err(|e| anyhow!("server startup failure: {:?}", e))?;

    let server_task = server.start();

    tokio::select! {
        _ = server_task => bail!("server stopped early"),
        sig = shutdown_signal() => {
            let sig = sig?;
            info!(log, "{sig} received; cancelling jobs for {}", jobs.host());
        }
    }

    /*
     * Ask every running job to stop, so that scratch directories do not
     * outlive the process.
     */
    jobs.cancel_all();
    let start = std::time::Instant::now();
    while jobs.status().running_jobs > 0 {
        if start.elapsed() > SHUTDOWN_GRACE {
            warn!(log, "{} jobs still running at exit",
                jobs.status().running_jobs);
            break;
        }
        sleep_ms(250).await;
    }

    Ok(())
}
