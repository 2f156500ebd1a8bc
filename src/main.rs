//! maintd - manage maintenance requests for this machine.

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maintd::activity::{
    Activity, LiveProbes, RebootType, SystemProbes, SystemUpdateActivity, VmChangeActivity,
};
use maintd::manager::{Config, ManagerError, ReqManager, DEFAULT_CONFIG_FILE};
use maintd::request::Request;
use maintd::types::Estimate;

#[derive(Debug, Parser)]
#[command(name = "maintd", about = "Manage maintenance requests for this machine.")]
struct Cli {
    /// Show debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the agent config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the spool directory from the config file.
    #[arg(long, global = true)]
    spooldir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run all maintenance requests that are due.
    Run {
        /// Execute all pending requests now, regardless of due times.
        #[arg(long)]
        run_all_now: bool,

        /// Also ignore postpone/tempfail signals from enter hooks.
        #[arg(long)]
        force_run: bool,
    },

    /// Submit pending requests for scheduling.
    Schedule,

    /// List active maintenance requests.
    List,

    /// Show details for one request.
    Show {
        /// Request id (or unique prefix); the first request when omitted.
        request_id: Option<String>,
    },

    /// Delete a request by id (or unique prefix).
    Delete {
        request_id: String,

        /// Keep the record in the active spool instead of archiving it.
        #[arg(long)]
        no_archive: bool,
    },

    /// Create a new request.
    #[command(subcommand)]
    Request(RequestCommand),
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    /// Request to run a shell script.
    Script {
        comment: String,
        script: String,

        /// Estimated duration ("30m", "1h", seconds).
        #[arg(long)]
        estimate: Option<String>,
    },

    /// Request a reboot.
    Reboot {
        #[arg(long)]
        comment: Option<String>,

        /// Power off instead of a warm reboot.
        #[arg(long)]
        cold_reboot: bool,
    },

    /// Request a VM resource change.
    VmChange {
        /// Wanted memory in MiB.
        #[arg(long)]
        memory: Option<u64>,

        /// Wanted number of CPU cores.
        #[arg(long)]
        cores: Option<u32>,
    },

    /// Request a system update.
    Update {
        /// Channel URL to update to.
        channel_url: String,

        #[arg(long)]
        environment: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "maintd=debug" } else { "maintd=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "maintd-failed");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, ManagerError> {
    let mut config = Config::load(&cli.config)?;
    if let Some(spooldir) = cli.spooldir {
        config.spooldir = spooldir;
    }
    let mut rm = ReqManager::new(config)?;

    match cli.command {
        Command::Run {
            run_all_now,
            force_run,
        } => {
            rm.connect()?;
            rm.lock()?;
            let now = Utc::now();
            rm.update_states(now)?;
            let outcome = rm.execute(run_all_now, force_run)?;
            if outcome.reboot.is_some() {
                // Rebooting while still in maintenance; bookkeeping
                // resumes after boot.
                return Ok(ExitCode::SUCCESS);
            }
            rm.postpone(Utc::now())?;
            rm.archive(Utc::now())?;
        }
        Command::Schedule => {
            rm.connect()?;
            rm.lock()?;
            rm.schedule(Utc::now())?;
        }
        Command::List => {
            let listing = rm.list()?;
            if !listing.is_empty() {
                println!("{listing}");
            }
        }
        Command::Show { request_id } => {
            match rm.show(request_id.as_deref().unwrap_or(""))? {
                Some(details) => println!("{details}"),
                None => {
                    eprintln!("no matching request");
                    return Ok(ExitCode::from(1));
                }
            }
        }
        Command::Delete {
            request_id,
            no_archive,
        } => {
            rm.connect()?;
            rm.lock()?;
            if !rm.delete(&request_id)? {
                return Ok(ExitCode::from(1));
            }
            if !no_archive {
                rm.archive(Utc::now())?;
            }
        }
        Command::Request(request) => {
            // Significant merges may ask the Directory for a notice
            // window; a missing connection only degrades that.
            if let Err(err) = rm.connect() {
                tracing::debug!(error = %err, "request-add-without-directory");
            }
            rm.lock()?;
            return add_request(&mut rm, request);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn add_request(rm: &mut ReqManager, command: RequestCommand) -> Result<ExitCode, ManagerError> {
    let request = match command {
        RequestCommand::Script {
            comment,
            script,
            estimate,
        } => {
            let mut request = Request::new(Activity::shell_script(script)).with_comment(comment);
            if let Some(estimate) = estimate {
                match Estimate::from_str(&estimate) {
                    Ok(estimate) => request = request.with_estimate(estimate),
                    Err(err) => {
                        eprintln!("invalid estimate: {err}");
                        return Ok(ExitCode::from(2));
                    }
                }
            }
            request
        }
        RequestCommand::Reboot {
            comment,
            cold_reboot,
        } => {
            let action = if cold_reboot {
                RebootType::Cold
            } else {
                RebootType::Warm
            };
            let boot_time = LiveProbes.boot_time().ok();
            let mut request = Request::new(Activity::reboot(action, boot_time));
            if let Some(comment) = comment {
                request = request.with_comment(comment);
            }
            request
        }
        RequestCommand::VmChange { memory, cores } => {
            let probes = LiveProbes;
            match VmChangeActivity::from_system_if_changed(memory, cores, &probes) {
                Ok(Some(activity)) => Request::new(Activity::vm_change(activity)),
                Ok(None) => {
                    tracing::info!("vm-change-noop-skipped");
                    return Ok(ExitCode::SUCCESS);
                }
                Err(err) => {
                    eprintln!("probing system state failed: {err}");
                    return Ok(ExitCode::from(2));
                }
            }
        }
        RequestCommand::Update {
            channel_url,
            environment,
        } => {
            let mut activity = SystemUpdateActivity::new(channel_url, environment);
            if let Err(err) = activity.prepare(rm.platform()) {
                tracing::error!(error = %err, "update-prepare-failed");
                return Ok(ExitCode::from(2));
            }
            let comment = activity.changelog();
            Request::new(Activity::system_update(activity)).with_comment(comment)
        }
    };

    match rm.add(request, false)? {
        Some(id) => tracing::info!(request = %id, "request-added"),
        None => tracing::info!("request-absorbed-or-skipped"),
    }
    Ok(ExitCode::SUCCESS)
}
