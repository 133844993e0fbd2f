//! CCB broker daemon
//!
//! Runs the broker until SIGTERM/SIGINT; SIGHUP reloads the configuration
//! file without dropping registered targets.

use ccb_broker::{Broker, BrokerConfig, Control, RunExit};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = BrokerConfig::from_args(&args)?;

    log::info!("CCB broker starting...");
    log::info!("  Listen:        {}", config.listen);
    log::info!("  Sweep:         {}s", config.sweep_interval_secs);
    log::info!("  Heartbeat:     {}s", config.heartbeat_interval_secs);
    log::info!("  Allow any IP:  {}", config.reconnect_allow_any_ip);

    let control = Control::default();
    signal_hook::flag::register(SIGTERM, control.shutdown.clone())?;
    signal_hook::flag::register(SIGINT, control.shutdown.clone())?;
    signal_hook::flag::register(SIGHUP, control.reload.clone())?;

    let mut broker = Broker::new(config)?;

    loop {
        match broker.run(&control)? {
            RunExit::Reload => reload(&mut broker, &args),
            RunExit::Shutdown => break,
        }
    }

    broker.shutdown();
    log::info!("CCB broker stopped");
    Ok(())
}

/// Re-read the command line (and its config file); keep running on errors
fn reload(broker: &mut Broker, args: &[String]) {
    log::info!("Reloading configuration");
    match BrokerConfig::from_args(args) {
        Ok(config) => broker.reconfigure(config),
        Err(e) => log::error!("Keeping previous configuration: {}", e),
    }
}
