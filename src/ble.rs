use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SyncError},
    protocol::Frame,
    transport::{Channel, Transport, TransportEvent},
    types::SyncConfig,
    COMMAND_CHAR_UUID, HANDSHAKE_CHAR_UUID, LIFESPAN_SERVICE_UUID,
};

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

/// Subscribed GATT link to one console
struct Link {
    peripheral: Peripheral,
    command: Characteristic,
    handshake: Option<Characteristic>,
    forwarder: JoinHandle<()>,
}

/// [`Transport`] over the first local Bluetooth adapter
pub struct BtleTransport {
    central: Adapter,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent<PeripheralId>>,
    connect_timeout_ms: u64,
    central_events: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter and start forwarding its events
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`SyncError::Ble`] if the adapter cannot be initialized.
    pub async fn new(
        config: &SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent<PeripheralId>>)> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SyncError::DeviceNotFound)?;

        let (events, receiver) = mpsc::unbounded_channel();
        let links: Links = Arc::new(Mutex::new(HashMap::new()));

        let stream = central.events().await?;
        let central_events = tokio::spawn(forward_central_events(
            central.clone(),
            stream,
            Arc::clone(&links),
            events.clone(),
        ));

        // btleplug only hands out adapters that are usable
        let _ = events.send(TransportEvent::AdapterStateChanged { ready: true });
        info!("Bluetooth adapter ready");

        Ok((
            Self {
                central,
                links,
                events,
                connect_timeout_ms: config.connect_timeout_ms,
                central_events,
            },
            receiver,
        ))
    }

    async fn subscribe(&self, peripheral: Peripheral) -> Result<()> {
        peripheral.discover_services().await?;

        let service_uuid = parse_uuid(LIFESPAN_SERVICE_UUID, "service")?;
        let command_uuid = parse_uuid(COMMAND_CHAR_UUID, "command characteristic")?;
        let handshake_uuid = parse_uuid(HANDSHAKE_CHAR_UUID, "handshake characteristic")?;

        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| SyncError::Protocol("LifeSpan service not found".to_string()))?;

        let command = service
            .characteristics
            .iter()
            .find(|c| c.uuid == command_uuid)
            .ok_or_else(|| SyncError::Protocol("Command characteristic not found".to_string()))?
            .clone();
        let handshake = service
            .characteristics
            .iter()
            .find(|c| c.uuid == handshake_uuid)
            .cloned();

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&command).await?;

        let id = peripheral.id();
        let forwarder = tokio::spawn(forward_notifications(
            id.clone(),
            command.uuid,
            notifications,
            self.events.clone(),
        ));

        self.links.lock().await.insert(
            id.clone(),
            Link {
                peripheral,
                command,
                handshake,
                forwarder,
            },
        );

        let _ = self.events.send(TransportEvent::Subscribed(id));
        Ok(())
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.central_events.abort();
    }
}

#[async_trait]
impl Transport for BtleTransport {
    type Device = PeripheralId;

    async fn start_scan(&self) -> Result<()> {
        self.central.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.central.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &PeripheralId) -> Result<()> {
        let peripheral = self.central.peripheral(device).await?;
        info!("Connecting to {:?}", device);

        timeout(
            std::time::Duration::from_millis(self.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| SyncError::Timeout {
            timeout_ms: self.connect_timeout_ms,
        })?
        .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        if let Err(e) = self.subscribe(peripheral.clone()).await {
            let _ = peripheral.disconnect().await;
            return Err(e);
        }

        info!("Subscribed to {:?}", device);
        Ok(())
    }

    async fn disconnect(&self, device: &PeripheralId) -> Result<()> {
        let link = self.links.lock().await.remove(device);
        match link {
            Some(link) => {
                link.forwarder.abort();
                link.peripheral.disconnect().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn write(&self, device: &PeripheralId, channel: Channel, frame: &Frame) -> Result<()> {
        let links = self.links.lock().await;
        let link = links.get(device).ok_or(SyncError::Disconnected)?;
        let characteristic = match channel {
            Channel::Command => &link.command,
            Channel::Handshake => link.handshake.as_ref().ok_or_else(|| {
                SyncError::Protocol("Handshake characteristic not found".to_string())
            })?,
        };

        debug!("Sending {} frame: {:02X?}", channel, frame.as_bytes());
        link.peripheral
            .write(characteristic, frame.as_bytes(), WriteType::WithResponse)
            .await
            .map_err(|e| SyncError::Protocol(format!("Failed to send frame: {e}")))?;

        Ok(())
    }
}

fn parse_uuid(uuid: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid).map_err(|e| SyncError::Protocol(format!("Invalid {what} UUID: {e}")))
}

async fn forward_central_events(
    central: Adapter,
    mut stream: impl futures::Stream<Item = CentralEvent> + Unpin,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent<PeripheralId>>,
) {
    while let Some(event) = stream.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let name = match central.peripheral(&id).await {
                    Ok(peripheral) => peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|p| p.local_name),
                    Err(e) => {
                        debug!("Lost track of {:?}: {}", id, e);
                        continue;
                    }
                };
                TransportEvent::Discovered { device: id, name }
            }
            CentralEvent::DeviceConnected(id) => TransportEvent::Connected(id),
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(link) = links.lock().await.remove(&id) {
                    link.forwarder.abort();
                }
                TransportEvent::Disconnected(id)
            }
            _ => continue,
        };

        if events.send(forwarded).is_err() {
            break;
        }
    }
    warn!("Bluetooth event stream ended");
}

async fn forward_notifications(
    device: PeripheralId,
    characteristic: Uuid,
    mut notifications: impl futures::Stream<Item = btleplug::api::ValueNotification> + Unpin,
    events: mpsc::UnboundedSender<TransportEvent<PeripheralId>>,
) {
    while let Some(notification) = notifications.next().await {
        if notification.uuid != characteristic {
            continue;
        }

        let event = TransportEvent::ValueUpdated {
            device: device.clone(),
            value: Bytes::from(notification.value),
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Notification stream for {:?} closed", device);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parsing() {
        assert!(parse_uuid(LIFESPAN_SERVICE_UUID, "service").is_ok());
        assert!(parse_uuid(COMMAND_CHAR_UUID, "command").is_ok());
        assert!(parse_uuid(HANDSHAKE_CHAR_UUID, "handshake").is_ok());
        assert!(parse_uuid(crate::SYNC_SERVICE_UUID, "sync service").is_ok());
        assert!(parse_uuid(crate::SYNC_CHAR_UUID, "sync characteristic").is_ok());
    }

    #[test]
    fn test_uuid_parsing_rejects_garbage() {
        let err = parse_uuid("FFF1", "command").unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_gatt_uuids_are_sixteen_bit_aliases() {
        let command = parse_uuid(COMMAND_CHAR_UUID, "command").unwrap();
        assert_eq!(command.as_fields().0, 0xFFF1);
        let handshake = parse_uuid(HANDSHAKE_CHAR_UUID, "handshake").unwrap();
        assert_eq!(handshake.as_fields().0, 0xFFF2);
    }
}
