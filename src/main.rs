use anyhow::{Context, Result, anyhow};
use nvoverdrive::{
    app_config::AppConfig,
    arg_parser::ArgsOptions,
    attribute_client::AttributeClient,
    clock_controller::ClockController,
    cooler_controller::{CoolerController, FanMode},
    device::Device,
    logger,
    profile_store::ProfileStore,
    state_manager::{StateManager, log_error_chain},
    telemetry::{MetricChannel, poller::TelemetryPoller},
};
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;

use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logger::init_logging();

    // Parse the command line arguments
    let config = AppConfig::from_args(ArgsOptions::parse());

    if let Err(err) = run(config).await {
        for e in err.chain() {
            error!("{e}");
        }

        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let client = AttributeClient::open(config.backend)
        .with_context(|| "Failed to open the GPU control session")?;

    let devices = client
        .enumerate_devices()
        .with_context(|| "Failed to enumerate the GPUs")?;

    let mut store = ProfileStore::open(config.config_path.as_deref())
        .with_context(|| "Failed to load the profiles")?;

    let manager = StateManager::new(&client, devices);

    let applied = manager.apply_on_start(&mut store);
    info!("Applied {applied} profile(s) on start");

    if config.list_only {
        for device in manager.devices() {
            print_device(&client, &mut store, device);
        }

        return Ok(());
    }

    let device = manager
        .device(config.gpu)
        .cloned()
        .ok_or_else(|| anyhow!("No GPU with ordinal {}", config.gpu))?;

    if let Some(name) = &config.apply_profile {
        if let Err(err) = manager.apply_named_profile(&store, &device, name) {
            log_error_chain(&err);
        }
    }

    let mut poller = TelemetryPoller::new(&client, device, &config);
    for channel in MetricChannel::ALL {
        poller.subscribe(channel);
    }

    // This token is used to stop the poller on Ctrl-C
    let token = CancellationToken::new();

    let shutdown = {
        let token = token.clone();

        async move {
            if let Err(err) = ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {err}");
            }

            token.cancel();
        }
    };

    tokio::join!(poller.run(token, log_samples), shutdown);

    Ok(())
}

fn log_samples(poller: &TelemetryPoller) {
    let samples = poller
        .latest_values()
        .iter()
        .map(|(channel, value)| format!("{}: {value}", channel.title()))
        .collect::<Vec<_>>()
        .join(", ");

    info!("GPU {}: {samples}", poller.device().id);
}

// Print the settings and profiles of a device, failed reads are logged
fn print_device(client: &AttributeClient, store: &mut ProfileStore, device: &Device) {
    println!("{}", device.summary());

    let clocks = ClockController::new(client);
    let cooler = CoolerController::new(client);

    match clocks.get_clock_range(device) {
        Ok(r) => println!(
            "  offset ranges: core [{}, {}] MHz, memory [{}, {}] MHz",
            r.core_min, r.core_max, r.mem_min, r.mem_max
        ),
        Err(err) => log_error_chain(&err),
    }

    match clocks.get_clock_offsets(device) {
        Ok(o) => println!("  offsets: core {} MHz, memory {} MHz", o.core, o.mem),
        Err(err) => log_error_chain(&err),
    }

    match cooler.get_cooler_info(device) {
        Ok(c) => println!(
            "  fan: {} mode, target {}%, current {}%",
            FanMode::from(c.is_manual),
            c.target_level,
            c.current_level
        ),
        Err(err) => log_error_chain(&err),
    }

    let profiles = match store.get_profiles(&device.uuid) {
        Ok(profiles) => profiles,
        Err(err) => {
            log_error_chain(&err);
            return;
        }
    };

    let marker = store.get_apply_on_start(&device.uuid);

    for (name, p) in &profiles {
        let on_start = if marker == Some(name.as_str()) {
            " (apply on start)"
        } else {
            ""
        };

        println!(
            "  profile \"{name}\"{on_start}: power {}%, core {:+} MHz, \
             memory {:+} MHz, fan {}",
            p.power_limit,
            p.core_clock_offset,
            p.mem_clock_offset,
            if p.manual_fan_control {
                format!("{}%", p.fan_speed)
            } else {
                FanMode::Auto.to_string()
            }
        );
    }
}
