use std::{
    error::Error,
    process::ExitCode,
    sync::atomic::Ordering,
};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use aistack::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    logs::show_logs,
    runtime::{self, RuntimeMode},
    stack::{StackController, render_json, render_report},
    supervisor::Supervisor,
};

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    runtime::init(if args.sys {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    });
    debug!(
        "Runtime mode {:?}; state under {}",
        runtime::mode(),
        runtime::state_dir().display()
    );

    let controller = build_controller(&args.config)?;
    let color = !args.no_color;

    let healthy = match &args.command {
        Commands::Start { services } => {
            register_signal_handler(controller.supervisor())?;
            let report = controller.start(services)?;
            let success = report.is_success();
            if args.json {
                println!("{}", render_json("start", success, &report)?);
            } else {
                print!("{}", render_report("start", &report, color));
            }
            success
        }
        Commands::Stop { services } => {
            let report = controller.stop(services)?;
            let success = report.is_success();
            if args.json {
                println!("{}", render_json("stop", success, &report)?);
            } else {
                print!("{}", render_report("stop", &report, color));
            }
            success
        }
        Commands::Status { services } => {
            let report = controller.status(services)?;
            let success = report.is_success();
            if args.json {
                println!("{}", render_json("status", success, &report)?);
            } else {
                print!("{}", render_report("status", &report, color));
            }
            success
        }
        Commands::Logs { service, lines } => {
            let selected = controller.select(std::slice::from_ref(service))?;
            for descriptor in selected {
                info!("Fetching logs for service: {}", descriptor.name);
                show_logs(&descriptor.name, &descriptor.log_path, *lines)?;
            }
            true
        }
    };

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_controller(config_path: &str) -> Result<StackController, Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let controller = StackController::from_config(&config)?;
    Ok(controller)
}

/// Ctrl-C aborts the readiness wait in progress; services already spawned keep running.
fn register_signal_handler(supervisor: &Supervisor) -> Result<(), Box<dyn Error>> {
    let flag = supervisor.cancel_flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("Interrupted: finishing the current service and leaving spawned processes running");
    })?;

    Ok(())
}
