use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use travel_sync_core::{
    convergence_bound, system_clock, DeferredSyncbase, DeviceIdentity, OfflinePlaceResolver,
    Place, PlaceData, Store, SyncLoop, SyncgroupHandle, SyncgroupKey, SyncgroupRegistry,
    TravelSession, SYNC_SLA,
};

use super::config_cmd::OutputFormat;
use crate::config::Config;

const SYNCGROUP_NAME: &str = "travel";
const SHARED_PREFIXES: [&str; 3] = ["trips", "user", "devices"];

#[derive(Args)]
pub struct SimulateCommand {
    /// Number of devices (overrides config)
    #[arg(long, short)]
    pub devices: Option<usize>,

    /// Destinations the first device adds to its trip
    #[arg(long, default_value = "3")]
    pub destinations: usize,

    /// Message the first device sends once its trip exists
    #[arg(long, short)]
    pub message: Option<String>,

    /// Give up after this many rounds
    #[arg(long, default_value = "40")]
    pub max_rounds: usize,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Per-device outcome of a simulation run.
#[derive(Debug, Serialize)]
struct DeviceReport {
    device: String,
    trip: Option<String>,
    destinations: Vec<String>,
    messages: Vec<String>,
    cast_targets: usize,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    converged: bool,
    rounds: usize,
    elapsed_ms: u128,
    convergence_bound_ms: u128,
    devices: Vec<DeviceReport>,
}

struct Device {
    store: Store,
    session: TravelSession,
    messages: Vec<String>,
}

impl Device {
    async fn process(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let update = self.session.process_snapshot(self.store.get_data()?).await;
        for e in &update.errors {
            warn!("{}: {}", self.session.identity(), e);
        }
        if update.possible_nearby_devices {
            debug!("{}: nearby devices appeared", self.session.identity());
        }
        self.messages
            .extend(update.messages.into_iter().map(|m| m.text));
        update.writes.await?;
        Ok(())
    }

    fn report(&self) -> DeviceReport {
        DeviceReport {
            device: self.session.identity().to_string(),
            trip: self.session.trips().active_trip_id().map(str::to_string),
            destinations: self.session.destinations().ids(),
            messages: self.messages.clone(),
            cast_targets: self
                .session
                .devices()
                .possible_cast_targets()
                .values()
                .map(|devices| devices.len())
                .sum(),
        }
    }
}

impl SimulateCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let count = self.devices.unwrap_or(config.devices.value).max(1);
        let username = config.username.value.clone();
        let period = config.engine.sync_period();
        let bound = convergence_bound(count, period);
        if bound > SYNC_SLA {
            warn!(
                "{} devices at {:?} may take {:?} to converge",
                count, period, bound
            );
        }

        let registry = SyncgroupRegistry::new();
        let group = SyncgroupKey::new(username.clone(), SYNCGROUP_NAME);
        let prefixes = SHARED_PREFIXES.iter().map(|p| vec![p.to_string()]).collect::<Vec<_>>();

        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            let store = Store::new();
            let handle = SyncgroupHandle::new(&registry, &store, group.clone());
            if handle
                .join_or_create(handle.build_spec(prefixes.clone()))
                .await?
            {
                info!("Created syncgroup {}", group);
            }

            let deferred = DeferredSyncbase::new();
            deferred.resolve(Arc::new(store.clone()));
            let identity = DeviceIdentity::new(username.clone(), format!("device-{}", index));
            let session = TravelSession::new(
                deferred,
                identity,
                Box::new(OfflinePlaceResolver),
                system_clock(),
            );
            session.devices().heartbeat().beat().await?;
            devices.push(Device {
                store,
                session,
                messages: Vec::new(),
            });
        }

        let sync = SyncLoop::new(registry, config.engine.tie_break);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.run(period, shutdown_rx).await })
        };

        let started = Instant::now();
        let first = &mut devices[0];
        first.process().await?;
        for index in 0..self.destinations {
            let place = Place::new(PlaceData::from_place_id(format!("place-{}", index)));
            first.session.add_destination(index, Some(place)).await?;
        }
        if let Some(text) = &self.message {
            first.session.send_message(text.clone()).await?;
        }

        let mut rounds = 0;
        let mut converged = false;
        while rounds < self.max_rounds {
            rounds += 1;
            tokio::time::sleep(period).await;
            for device in devices.iter_mut() {
                device.process().await?;
            }
            converged = is_converged(&devices);
            if converged {
                break;
            }
        }
        let elapsed = started.elapsed();

        let _ = shutdown.send(true);
        runner.await?;

        if converged {
            info!("Converged {} devices in {} rounds", count, rounds);
        } else {
            warn!("No convergence after {} rounds", rounds);
        }

        let report = SimulationReport {
            converged,
            rounds,
            elapsed_ms: elapsed.as_millis(),
            convergence_bound_ms: bound.as_millis(),
            devices: devices.iter().map(Device::report).collect(),
        };
        print_report(&report, self.format)
    }
}

fn is_converged(devices: &[Device]) -> bool {
    let Some((first, rest)) = devices.split_first() else {
        return true;
    };
    let trip = first.session.trips().active_trip_id();
    let ids = first.session.destinations().ids();
    trip.is_some()
        && rest.iter().all(|d| {
            d.session.trips().active_trip_id() == trip && d.session.destinations().ids() == ids
        })
}

fn print_report(
    report: &SimulationReport,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            println!(
                "{} after {} rounds ({} ms, bound {} ms)",
                if report.converged {
                    "Converged"
                } else {
                    "Not converged"
                },
                report.rounds,
                report.elapsed_ms,
                report.convergence_bound_ms
            );
            println!();
            for device in &report.devices {
                println!("{}", device.device);
                println!("  trip: {}", device.trip.as_deref().unwrap_or("-"));
                println!("  destinations: {}", device.destinations.len());
                for message in &device.messages {
                    println!("  message: {}", message);
                }
                println!("  cast targets: {}", device.cast_targets);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, ConfigValue};
    use travel_sync_core::EngineConfig;

    fn device(name: &str) -> Device {
        let store = Store::new();
        let deferred = DeferredSyncbase::new();
        deferred.resolve(Arc::new(store.clone()));
        Device {
            session: TravelSession::new(
                deferred,
                DeviceIdentity::new("alice", name),
                Box::new(OfflinePlaceResolver),
                system_clock(),
            ),
            store,
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fresh_devices_are_not_converged() {
        let devices = vec![device("a"), device("b")];
        assert!(!is_converged(&devices));
    }

    #[tokio::test]
    async fn test_single_device_converges_once_trip_exists() {
        let mut devices = vec![device("a")];
        devices[0].process().await.unwrap();
        assert!(is_converged(&devices));

        let report = devices[0].report();
        assert_eq!(report.device, "alice/a");
        assert!(report.trip.is_some());
        assert!(report.destinations.is_empty());
    }

    #[tokio::test]
    async fn test_run_converges_two_devices() {
        let config = Config {
            username: ConfigValue::new("alice".to_string(), ConfigSource::Default),
            devices: ConfigValue::new(2, ConfigSource::Default),
            sync_period_ms: ConfigValue::new(25, ConfigSource::Default),
            config_file: None,
            engine: EngineConfig::default(),
        };
        let command = SimulateCommand {
            devices: Some(2),
            destinations: 2,
            message: Some("hello".to_string()),
            max_rounds: 40,
            format: OutputFormat::Json,
        };
        command.run(&config).await.unwrap();
    }
}
