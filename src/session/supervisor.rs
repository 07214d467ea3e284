/// Matches discovered devices to configured slots and runs their sessions
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::transport::{Advertisement, Radio};
use crate::models::{DeviceIdentity, DeviceRole, DeviceSpec};
use crate::session::device::{DeviceSession, SessionSettings};
use crate::storage::RecordStore;

/// A discovered device bound to one configured slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub identity: DeviceIdentity,
    pub role: DeviceRole,
}

/// Bind advertisements to slots
///
/// Specs are tried in slot order and each takes the first advertisement
/// (in discovery order) whose name contains its pattern. A device is bound
/// to at most one slot and a slot to at most one device, so a device seen
/// twice, or a name matching several patterns, never yields two sessions.
///
/// # Returns
/// One assignment per matched slot, in slot order
pub fn assign_devices(advertisements: &[Advertisement], specs: &[DeviceSpec]) -> Vec<Assignment> {
    let mut specs: Vec<&DeviceSpec> = specs.iter().collect();
    specs.sort_by_key(|spec| spec.slot);

    let mut taken: HashSet<&str> = HashSet::new();
    let mut assignments = Vec::new();

    for spec in specs {
        let matched = advertisements
            .iter()
            .find(|ad| !taken.contains(ad.address.as_str()) && spec.matches(&ad.name));

        match matched {
            Some(ad) => {
                taken.insert(ad.address.as_str());
                info!(
                    "Slot {} ({}) -> {} at {}",
                    spec.slot, spec.label, ad.name, ad.address
                );
                assignments.push(Assignment {
                    identity: DeviceIdentity {
                        label: spec.label.clone(),
                        address: ad.address.clone(),
                        slot: spec.slot,
                    },
                    role: spec.role,
                });
            }
            None => warn!(
                "No device matching '{}' found, slot {} ({}) will stay empty",
                spec.pattern, spec.slot, spec.label
            ),
        }
    }

    assignments
}

/// Discovers devices once and keeps one session per matched slot running
pub struct Supervisor {
    radio: Arc<dyn Radio>,
    store: Arc<RecordStore>,
    specs: Vec<DeviceSpec>,
    settings: SessionSettings,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        radio: Arc<dyn Radio>,
        store: Arc<RecordStore>,
        specs: Vec<DeviceSpec>,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Supervisor {
            radio,
            store,
            specs,
            settings,
            shutdown,
        }
    }

    /// Discover, spawn every matched session and wait for all of them
    ///
    /// Sessions only end on shutdown, so this returns when the process is
    /// stopping, or straight away when no configured device was found.
    ///
    /// # Returns
    /// Number of sessions that were started
    pub async fn run(self, scan_duration: Duration) -> usize {
        info!(
            "Scanning for {} device(s) for {} seconds",
            self.specs.len(),
            scan_duration.as_secs()
        );

        let advertisements = tokio::select! {
            result = self.radio.discover(scan_duration) => match result {
                Ok(advertisements) => advertisements,
                Err(e) => {
                    error!("Scan failed: {}", e);
                    return 0;
                }
            },
            _ = self.shutdown.cancelled() => return 0,
        };

        let assignments = assign_devices(&advertisements, &self.specs);
        if assignments.is_empty() {
            warn!("No configured devices found, ingestion not started");
            return 0;
        }

        let sessions: Vec<DeviceSession> = assignments
            .into_iter()
            .map(|assignment| {
                DeviceSession::new(
                    assignment.identity,
                    assignment.role,
                    Arc::clone(&self.radio),
                    Arc::clone(&self.store),
                    self.settings.clone(),
                    self.shutdown.clone(),
                )
            })
            .collect();

        spawn_and_wait(sessions).await
    }
}

/// Run sessions concurrently until every one of them has returned
async fn spawn_and_wait(sessions: Vec<DeviceSession>) -> usize {
    let started = sessions.len();
    let mut tasks = JoinSet::new();

    for session in sessions {
        let label = session.identity().label.clone();
        tasks.spawn(async move { (label, session.run().await) });
    }
    info!("Started {} device session(s)", started);

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((label, state)) => info!("{}: session ended ({})", label, state),
            Err(e) => error!("Device session task failed: {}", e),
        }
    }

    started
}
