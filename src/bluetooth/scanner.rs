/// Bluetooth Low Energy discovery and GATT links over BlueZ
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, Uuid};
use futures_util::{stream, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::time::{sleep, Duration};

use crate::bluetooth::transport::{Advertisement, Link, NotificationStream, Radio};
use crate::error::TransportError;

// GATT services are resolved asynchronously by bluetoothd after connecting
const SERVICE_RESOLVE_POLL_MS: u64 = 100;
const SERVICE_RESOLVE_ATTEMPTS: u32 = 100;

/// Radio backed by the default BlueZ adapter
pub struct BluerRadio {
    adapter: Adapter,
    // Keeps the D-Bus connection alive for as long as the adapter is used
    _session: bluer::Session,
}

impl BluerRadio {
    /// Open a Bluetooth session and power on the default adapter
    pub async fn new() -> Result<Self, TransportError> {
        // Initialize Bluetooth session
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }

        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluerRadio {
            adapter,
            _session: session,
        })
    }
}

#[async_trait]
impl Radio for BluerRadio {
    /// Scan for Low Energy devices and report the named ones
    ///
    /// Discovery runs in the background for `timeout`; afterwards every
    /// device BlueZ knows about is queried for its advertised name. Devices
    /// without a name cannot match a pattern and are skipped.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        // Start device discovery in background
        let discovery_handle = match self.adapter.discover_devices().await {
            Ok(discovery_stream) => tokio::spawn(async move {
                let mut stream = discovery_stream;
                while let Some(event) = stream.next().await {
                    debug!("Discovery event: {:?}", event);
                }
            }),
            Err(e) => {
                return Err(TransportError::Discovery(format!(
                    "failed to start device discovery: {}",
                    e
                )));
            }
        };

        // Let discovery run for the configured duration
        sleep(timeout).await;

        // Stop discovery
        discovery_handle.abort();

        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(|e| TransportError::Discovery(format!("failed to list devices: {}", e)))?;

        let mut advertisements = Vec::new();
        for addr in addresses {
            let device = match self.adapter.device(addr) {
                Ok(device) => device,
                Err(_) => continue,
            };

            match device.name().await {
                Ok(Some(name)) => {
                    debug!("Discovered {} at {}", name, addr);
                    advertisements.push(Advertisement {
                        name,
                        address: addr.to_string().to_uppercase(),
                    });
                }
                Ok(None) => debug!("No advertised name for {}", addr),
                Err(e) => debug!("Failed to read name of {}: {}", addr, e),
            }
        }

        Ok(advertisements)
    }

    async fn open_link(&self, address: &str) -> Result<Box<dyn Link>, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            address: address.to_string(),
            reason,
        };

        let addr: Address = address
            .parse()
            .map_err(|e| connect_error(format!("invalid address: {}", e)))?;
        let device = self
            .adapter
            .device(addr)
            .map_err(|e| connect_error(e.to_string()))?;

        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| connect_error(e.to_string()))?;
        }

        let link = BluerLink {
            device,
            characteristics: Mutex::new(HashMap::new()),
        };
        if let Err(e) = link.wait_for_services().await {
            link.close().await;
            return Err(connect_error(e));
        }

        Ok(Box::new(link))
    }
}

/// Connected BlueZ device
pub struct BluerLink {
    device: Device,
    // Resolved once per connection; a reconnect builds a new link
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
}

impl BluerLink {
    async fn wait_for_services(&self) -> Result<(), String> {
        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            match self.device.is_services_resolved().await {
                Ok(true) => return Ok(()),
                Ok(false) => sleep(Duration::from_millis(SERVICE_RESOLVE_POLL_MS)).await,
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("GATT services were not resolved in time".into())
    }

    /// Find the characteristic with the given UUID in any service
    async fn characteristic(&self, uuid: Uuid) -> Result<Option<Characteristic>, bluer::Error> {
        if let Some(found) = self.cached(uuid) {
            return Ok(Some(found));
        }

        for service in self.device.services().await? {
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == uuid {
                    self.characteristics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(uuid, characteristic.clone());
                    return Ok(Some(characteristic));
                }
            }
        }
        Ok(None)
    }

    fn cached(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned()
    }
}

#[async_trait]
impl Link for BluerLink {
    async fn subscribe(&self, channel: Uuid) -> Result<NotificationStream, TransportError> {
        let subscribe_error = |reason: String| TransportError::Subscribe {
            channel: channel.to_string(),
            reason,
        };

        let characteristic = self
            .characteristic(channel)
            .await
            .map_err(|e| subscribe_error(e.to_string()))?
            .ok_or_else(|| subscribe_error("characteristic not found".into()))?;

        let reader = characteristic
            .notify_io()
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        // The reader yields an error once the link is gone, which ends the stream
        let notifications = stream::unfold(reader, |mut reader| async move {
            match reader.recv().await {
                Ok(data) => Some((data, reader)),
                Err(e) => {
                    debug!("Notification reader closed: {}", e);
                    None
                }
            }
        });

        Ok(notifications.boxed())
    }

    async fn write(&self, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let write_error = |reason: String| TransportError::Write {
            channel: channel.to_string(),
            reason,
        };

        let characteristic = self
            .characteristic(channel)
            .await
            .map_err(|e| write_error(e.to_string()))?
            .ok_or_else(|| write_error("characteristic not found".into()))?;

        characteristic
            .write(bytes)
            .await
            .map_err(|e| write_error(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn close(&self) {
        if let Err(e) = self.device.disconnect().await {
            debug!("Disconnect from {} failed: {}", self.device.address(), e);
        }
    }
}
