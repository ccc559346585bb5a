//! Launcher for a single pipeline node.

use std::path::Path;
use std::process::exit;

use log::{error, info};

use meshline::cancel::CancelToken;
use meshline::cli::CliArgs;
use meshline::codec::JsonCodec;
use meshline::config::PipelineConfig;
use meshline::driver::{Driver, PipelineOutcome, StepSet};
use meshline::logging;
use meshline::scripthost::bridge::ScriptHost;
use meshline::scripthost::managed_vars::DeltaTime;
use meshline::shutdown::init_signal_handler;
use meshline::steps::deserialize::DeserializeStep;
use meshline::steps::input::InputStep;
use meshline::steps::output::OutputStep;
use meshline::steps::script::ScriptStep;
use meshline::steps::serialize::SerializeStep;
use meshline::xthread::CANCEL;

/// Builds the fixed step set described by a loaded config.
fn build_step_set(config: &PipelineConfig, args: &CliArgs) -> StepSet {
    let (input, deserialize) = if config.source_pipeline_count > 0 {
        (
            Some(InputStep::new(
                config.name.clone(),
                config.source_pipeline_count,
                args.inbound_interface.clone(),
                args.outbound_interfaces.clone(),
                args.discovery_port,
            )),
            Some(DeserializeStep::new(Box::new(JsonCodec))),
        )
    } else {
        (None, None)
    };

    let scripts = config
        .scripts
        .iter()
        .enumerate()
        .map(|(i, path)| {
            ScriptStep::new(
                format!("script[{}]", i),
                path.clone(),
                vec![Box::new(DeltaTime::new())],
            )
        })
        .collect();

    let (serialize, output) = if !config.target_pipeline_names.is_empty() {
        (
            Some(SerializeStep::new(Box::new(JsonCodec))),
            Some(OutputStep::new(
                config.name.clone(),
                config.target_pipeline_names.clone(),
                args.discovery_port,
            )),
        )
    } else {
        (None, None)
    };

    StepSet {
        name: config.name.clone(),
        input,
        deserialize,
        scripts,
        serialize,
        output,
    }
}

fn crash_with_message(msg: String) -> ! {
    error!("{}", msg);
    exit(1);
}

fn main() {
    logging::init_logger();
    info!("Starting meshline...");

    let cancel = CancelToken::new();
    if CANCEL.set(cancel.clone()).is_err() {
        crash_with_message("Failed to register the cancellation token singleton".to_string());
    }
    if let Err(e) = init_signal_handler() {
        crash_with_message(format!("Failed to install the signal handler: {}", e));
    }

    let args = CliArgs::do_parse();

    let config = match PipelineConfig::load(&args.pipeline_file) {
        Ok(c) => c,
        Err(e) => crash_with_message(format!("Failed to load pipeline configuration: {}", e)),
    };

    let module_search_root = args.module_search_root.as_ref().map(Path::new);
    if let Err(e) = ScriptHost::initialize(module_search_root) {
        crash_with_message(format!("Failed to initialize the script host: {}", e));
    }

    let steps = build_step_set(&config, &args);
    let driver = Driver::new(steps);

    let waiter = match driver.start(cancel) {
        Ok(w) => w,
        Err(e) => crash_with_message(format!("Failed to start pipeline '{}': {}", config.name, e)),
    };

    match waiter.wait() {
        PipelineOutcome::Success => {
            info!("Pipeline '{}' terminated.", config.name);
        }
        PipelineOutcome::Failed(e) => {
            error!(
                "Pipeline '{}' failed: {} (root cause: {})",
                config.name,
                e,
                e.root_cause()
            );
            exit(1);
        }
    }
}
