//! BLE driver tunnelled over an OSC hop
//!
//! [`RemoteBleClient`] implements [`BleDriver`] by sending `/wbd_*` calls;
//! [`RemoteBleServer`] runs next to a real driver, replays those calls on it
//! and forwards its events back. Both ends obey the transport's liveness
//! queue like any other traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fitbridge_core::Uid;
use fitbridge_osc::address::wbd;
use fitbridge_osc::{OscTransport, WILDCARD_UID};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{BleDriver, DriverCall, EVENT_CAPACITY};
use crate::error::{BleDriverError, Result};
use crate::types::{
    DriverEvent, GattCharacteristic, GattDescriptor, ScanFilter, GATT_SUCCESS,
};
use crate::wire;

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Driver whose calls run in another process
pub struct RemoteBleClient {
    transport: OscTransport,
    events: broadcast::Sender<DriverEvent>,
}

impl RemoteBleClient {
    /// Install event handlers on the hop to the driver endpoint
    pub fn new(transport: OscTransport) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        for address in wbd::EVENTS {
            let tx = events.clone();
            transport.handle_device(address, WILDCARD_UID, move |delivery| {
                match wire::decode_event(&delivery) {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(e) => warn!("Dropping {}: {}", delivery.address, e),
                }
            })?;
        }
        Ok(Self { transport, events })
    }

    fn call(&self, call: DriverCall) -> Result<()> {
        let (address, uid, args) = wire::encode_call(&call)?;
        debug!("Remote driver call {}", address);
        match uid {
            Some(uid) => self.transport.send_device(address, &uid, args)?,
            None => self.transport.send(address, args)?,
        }
        Ok(())
    }

    fn reply_timeout(&self) -> Duration {
        self.transport.command_timeout()
    }
}

#[async_trait]
impl BleDriver for RemoteBleClient {
    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, scan_id: &str, filter: ScanFilter) -> Result<()> {
        if !Uid::is_uid(scan_id) {
            return Err(BleDriverError::Protocol(format!(
                "scan id {scan_id:?} must be a uid"
            )));
        }
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let events = self.events.clone();
        self.transport.handle_once(
            wbd::SCAN_STARTED,
            scan_id,
            Some(self.reply_timeout()),
            move |delivery| {
                let outcome = if delivery.timed_out {
                    Err(BleDriverError::Timeout("waiting for scan start".into()))
                } else {
                    wire::decode_event(&delivery)
                };
                if let Ok(event) = &outcome {
                    let _ = events.send(event.clone());
                }
                if let Some(tx) = tx.take() {
                    let _ = tx.send(outcome);
                }
            },
        )?;
        self.call(DriverCall::StartScan {
            scan_id: scan_id.to_string(),
            filter,
        })?;

        match rx.await {
            Ok(Ok(DriverEvent::ScanStarted { status, .. })) if status == GATT_SUCCESS => Ok(()),
            Ok(Ok(_)) => Err(BleDriverError::Adapter("driver refused to scan".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BleDriverError::Transport(fitbridge_osc::OscError::Closed)),
        }
    }

    async fn stop_scan(&self, scan_id: &str) -> Result<()> {
        self.call(DriverCall::StopScan {
            scan_id: scan_id.to_string(),
        })
    }

    async fn connect_gatt(&self, address: &str) -> Result<()> {
        self.call(DriverCall::ConnectGatt {
            address: address.to_string(),
        })
    }

    async fn close_gatt(&self, address: &str) -> Result<()> {
        self.call(DriverCall::CloseGatt {
            address: address.to_string(),
        })
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        self.call(DriverCall::DiscoverServices {
            address: address.to_string(),
        })
    }

    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        self.call(DriverCall::EnableNotifications {
            address: address.to_string(),
            characteristic,
            enable,
        })
    }

    async fn read_characteristic(&self, address: &str, characteristic: Uuid) -> Result<()> {
        self.call(DriverCall::ReadCharacteristic {
            address: address.to_string(),
            characteristic,
        })
    }

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: GattCharacteristic,
    ) -> Result<()> {
        self.call(DriverCall::WriteCharacteristic {
            address: address.to_string(),
            characteristic,
        })
    }

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: Uuid,
        descriptor: GattDescriptor,
    ) -> Result<()> {
        self.call(DriverCall::WriteDescriptor {
            address: address.to_string(),
            characteristic,
            descriptor,
        })
    }
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// Driver endpoint serving a [`RemoteBleClient`]
pub struct RemoteBleServer {
    transport: OscTransport,
    driver: Arc<dyn BleDriver>,
}

impl RemoteBleServer {
    pub fn new(transport: OscTransport, driver: Arc<dyn BleDriver>) -> Self {
        Self { transport, driver }
    }

    /// Serve calls until the transport closes
    pub async fn run(self) -> Result<()> {
        let (tx, mut calls) = mpsc::unbounded_channel();
        for address in wbd::CALLS {
            let tx = tx.clone();
            self.transport
                .handle_device(address, WILDCARD_UID, move |delivery| {
                    let _ = tx.send(delivery);
                })?;
        }
        drop(tx);

        let mut events = self.driver.events();
        info!("Remote BLE driver endpoint ready");
        loop {
            tokio::select! {
                delivery = calls.recv() => {
                    let Some(delivery) = delivery else {
                        break;
                    };
                    match wire::decode_call(&delivery) {
                        Ok(call) => self.invoke(call).await,
                        Err(e) => warn!("Dropping driver call {}: {}", delivery.address, e),
                    }
                }

                event = events.recv() => match event {
                    Ok(event) => self.forward(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Driver event channel lagged, {} events lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Remote BLE driver endpoint stopped");
        Ok(())
    }

    async fn invoke(&self, call: DriverCall) {
        let address = call.address().map(str::to_string);
        debug!("Driver call {:?}", call);
        if let Err(e) = call.invoke(self.driver.as_ref()).await {
            warn!("Driver call failed: {}", e);
            self.forward(&DriverEvent::OperationFailed {
                address,
                reason: e.reason(),
                message: e.to_string(),
            });
        }
    }

    fn forward(&self, event: &DriverEvent) {
        let sent = wire::encode_event(event).and_then(|(address, uid, args)| {
            match uid {
                Some(uid) => self.transport.send_device(address, &uid, args)?,
                None => self.transport.send(address, args)?,
            }
            Ok(())
        });
        if let Err(e) = sent {
            warn!("Cannot forward driver event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::types::{uuid16, GattCharacteristic, STATE_CONNECTED};
    use fitbridge_core::{LivenessMode, OscConfig};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn hop() -> (RemoteBleClient, MockDriver) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr_a, addr_b) = (a.local_addr().unwrap(), b.local_addr().unwrap());
        let config = OscConfig::new(addr_a, addr_b)
            .with_liveness(LivenessMode::Sender)
            .with_ping_interval(Duration::from_millis(50))
            .with_command_timeout(Duration::from_millis(500));
        let client_side = OscTransport::start_with_socket(a, addr_b, &config).unwrap();
        let server_side =
            OscTransport::start_with_socket(b, addr_a, &config.mirrored()).unwrap();

        let mock = MockDriver::new();
        let server = RemoteBleServer::new(server_side, Arc::new(mock.clone()));
        tokio::spawn(server.run());
        (RemoteBleClient::new(client_side).unwrap(), mock)
    }

    #[tokio::test]
    async fn test_scan_start_is_confirmed_by_scan_id() {
        let (client, mock) = hop().await;
        let mut events = client.events();
        let scan_id = Uid::generate().to_string();
        timeout(WAIT, client.start_scan(&scan_id, ScanFilter::default()))
            .await
            .unwrap()
            .unwrap();
        assert!(mock.is_scanning(&scan_id));
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            DriverEvent::ScanStarted {
                scan_id,
                status: GATT_SUCCESS
            }
        );
    }

    #[tokio::test]
    async fn test_events_flow_back_to_client() {
        let (client, mock) = hop().await;
        let mut events = client.events();
        client.connect_gatt("AA:BB:CC:DD:EE:FF").await.unwrap();
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            DriverEvent::ConnectionStateChange {
                address: "AA:BB:CC:DD:EE:FF".into(),
                status: GATT_SUCCESS,
                state: STATE_CONNECTED,
            }
        );

        mock.emit(DriverEvent::CharacteristicChanged {
            address: "AA:BB:CC:DD:EE:FF".into(),
            characteristic: GattCharacteristic::new(uuid16(0x2A37)).with_value(vec![0x00, 0x48]),
        });
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        match event {
            DriverEvent::CharacteristicChanged { characteristic, .. } => {
                assert_eq!(characteristic.value, vec![0x00, 0x48]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refused_calls_come_back_as_failures() {
        let (client, mock) = hop().await;
        let mut events = client.events();
        mock.set_adapter_available(false);
        client.discover_services("AA:BB:CC:DD:EE:FF").await.unwrap();
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        match event {
            DriverEvent::OperationFailed { address, reason, .. } => {
                assert_eq!(address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
                assert_eq!(reason, fitbridge_core::DisconnectReason::BleDisabled);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
