//! Frontend control client
//!
//! Typed calls against a running backend. Every call carries a correlation
//! uid (or the manager uid for device commands) and resolves with the
//! matching `/confirm`; negative confirms come back as
//! [`ServiceError::Rejected`].

use fitbridge_core::state::{MSG_COMMAND_TIMEOUT, MSG_DISCONNECT_FIRST};
use fitbridge_core::{ConfirmCode, Device, DeviceState, DisconnectReason, Record, Uid, User, View};
use fitbridge_osc::{address, Arg, ConfirmReply, Delivery, OscTransport, WILDCARD_UID};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connectors::ConnectorConfig;
use crate::devices::DeviceInfo;
use crate::error::{Result, ServiceError};

/// One `/listdevices_rv` entry
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceListing {
    /// Manager uid used for device commands
    pub uid: String,
    pub device: Device,
    pub state: DeviceState,
    pub reason: DisconnectReason,
    pub info: DeviceInfo,
}

impl DeviceListing {
    fn from_args(args: Vec<Arg>) -> Option<Self> {
        let mut args = args.into_iter();
        let uid = args.next()?.as_str()?.to_string();
        let device = args.next()?.into_entity::<Device>()?;
        let state = DeviceState::from_code(args.next()?.as_i64()? as i32)?;
        let reason = DisconnectReason::from_code(args.next()?.as_i64()? as i32)?;
        let info = args
            .next()
            .and_then(|a| a.as_str().and_then(|s| serde_json::from_str(s).ok()))
            .unwrap_or_default();
        Some(Self {
            uid,
            device,
            state,
            reason,
            info,
        })
    }
}

/// Text shown to the operator for a confirm, `None` when it succeeded
pub fn toast(code: ConfirmCode, message: &str) -> Option<String> {
    match code {
        ConfirmCode::Ok => None,
        ConfirmCode::Failed1 if message.is_empty() => Some("Command failed".to_string()),
        ConfirmCode::Failed1 => Some(format!("Error: {message}")),
        ConfirmCode::Failed2 if message.is_empty() => Some(MSG_DISCONNECT_FIRST.to_string()),
        ConfirmCode::Failed2 => Some(message.to_string()),
        ConfirmCode::Failed3 => Some(MSG_COMMAND_TIMEOUT.to_string()),
    }
}

/// Toast for a failed client call
pub fn toast_for(error: &ServiceError) -> String {
    match error {
        ServiceError::Rejected { code, message } => {
            toast(*code, message).unwrap_or_else(|| message.clone())
        }
        other => format!("Error: {other}"),
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlClient {
    transport: OscTransport,
}

impl ControlClient {
    pub fn new(transport: OscTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &OscTransport {
        &self.transport
    }

    async fn command(
        &self,
        address: &str,
        uid: Option<&str>,
        args: Vec<Arg>,
    ) -> Result<ConfirmReply> {
        let reply = self.transport.call(address, uid, args).await;
        debug!("{} -> {:?} {}", address, reply.code, reply.message);
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ServiceError::Rejected {
                code: reply.code,
                message: reply.message,
            })
        }
    }

    /// Run a list command, collecting the `_rv` messages sent before its confirm
    async fn listing(&self, address: &str, rv: &str) -> Result<Vec<Vec<Arg>>> {
        let corr = Uid::generate().to_string();
        let mut items = self.transport.subscribe(rv, &corr)?;
        let result = self.command(address, Some(&corr), Vec::new()).await;
        self.transport.unhandle(rv, &corr)?;
        result?;

        let mut out = Vec::new();
        while let Ok(delivery) = items.try_recv() {
            out.push(delivery.args);
        }
        Ok(out)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceListing>> {
        let rows = self.listing(address::LISTDEVICES, address::LISTDEVICES_RV).await?;
        Ok(rows
            .into_iter()
            .filter_map(|args| {
                let listing = DeviceListing::from_args(args);
                if listing.is_none() {
                    warn!("Malformed device listing");
                }
                listing
            })
            .collect())
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = self.listing(address::LISTUSERS, address::LISTUSERS_RV).await?;
        Ok(entities(rows))
    }

    pub async fn list_views(&self) -> Result<Vec<View>> {
        let rows = self.listing(address::LISTVIEWS, address::LISTVIEWS_RV).await?;
        Ok(entities(rows))
    }

    /// Create an unsaved manager of `kind`; returns its uid
    pub async fn new_device(&self, kind: &str) -> Result<String> {
        let reply = self
            .command(address::NEWDEVICE, None, vec![Arg::from(kind)])
            .await?;
        reply
            .payload
            .first()
            .and_then(Arg::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::bad_request("confirm without manager uid"))
    }

    pub async fn save_device(&self, manager: &str, device: Device) -> Result<Device> {
        let reply = self
            .command(
                address::DEVICE_SAVE,
                Some(manager),
                vec![Arg::from(Record::Device(device))],
            )
            .await?;
        first_entity(reply)
    }

    pub async fn delete_device(&self, manager: &str) -> Result<()> {
        self.command(address::DEVICE_DEL, Some(manager), Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn search(&self, manager: &str, start: bool) -> Result<()> {
        self.command(address::DEVICE_SEARCH, Some(manager), vec![Arg::from(start)])
            .await
            .map(|_| ())
    }

    pub async fn save_user(&self, user: User) -> Result<User> {
        let reply = self
            .command(address::SAVEUSER, None, vec![Arg::from(Record::User(user))])
            .await?;
        first_entity(reply)
    }

    pub async fn delete_user(&self, id: i64) -> Result<()> {
        self.command(address::DELUSER, None, vec![Arg::from(id)])
            .await
            .map(|_| ())
    }

    pub async fn save_view(&self, view: View) -> Result<View> {
        let reply = self
            .command(address::SAVEVIEW, None, vec![Arg::from(Record::View(view))])
            .await?;
        first_entity(reply)
    }

    pub async fn delete_view(&self, id: i64) -> Result<()> {
        self.command(address::DELVIEW, None, vec![Arg::from(id)])
            .await
            .map(|_| ())
    }

    /// Activate views and connect their devices for `user`; returns the
    /// number of devices planned
    pub async fn connect_views(&self, user: i64, views: &[i64]) -> Result<i64> {
        let mut args = vec![Arg::from(user)];
        args.extend(views.iter().map(|v| Arg::from(*v)));
        let reply = self.command(address::VIEW_CONNECT, None, args).await?;
        Ok(reply.payload.first().and_then(Arg::as_i64).unwrap_or(0))
    }

    /// Deactivate `views` (all when empty) and disconnect every device
    pub async fn disconnect_views(&self, views: &[i64]) -> Result<i64> {
        let args = views.iter().map(|v| Arg::from(*v)).collect();
        let reply = self.command(address::VIEW_DISCONNECT, None, args).await?;
        Ok(reply.payload.first().and_then(Arg::as_i64).unwrap_or(0))
    }

    pub async fn serve_connectors(&self, connectors: &[ConnectorConfig]) -> Result<()> {
        let json = serde_json::to_string(connectors)
            .map_err(|e| ServiceError::Connector(e.to_string()))?;
        self.command(address::SERVE_CONNECTORS, None, vec![Arg::from(json)])
            .await
            .map(|_| ())
    }

    pub async fn set_log_level(&self, level: &str) -> Result<()> {
        self.command(address::LOGLEVEL, None, vec![Arg::from(level)])
            .await
            .map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(address::STOP, None, Vec::new()).await.map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Broadcasts
    // ------------------------------------------------------------------------

    /// `/device_state [old, new, reason]` of every manager
    pub fn states(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        Ok(self.transport.subscribe(address::DEVICE_STATE, WILDCARD_UID)?)
    }

    /// `/device_fit [device, sample, state]` of every manager
    pub fn fits(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        Ok(self.transport.subscribe(address::DEVICE_FIT, WILDCARD_UID)?)
    }

    /// `/device_found [device]` while searching
    pub fn found(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        Ok(self.transport.subscribe(address::DEVICE_FOUND, WILDCARD_UID)?)
    }

    /// Operator messages from the fleet coordinator
    pub fn messages(&self) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        Ok(self.transport.subscribe(address::PRINTMSG, "")?)
    }
}

fn entities<E>(rows: Vec<Vec<Arg>>) -> Vec<E>
where
    E: TryFrom<Record, Error = Record>,
{
    rows.into_iter()
        .filter_map(|args| args.into_iter().next().and_then(Arg::into_entity))
        .collect()
}

fn first_entity<E>(reply: ConfirmReply) -> Result<E>
where
    E: TryFrom<Record, Error = Record>,
{
    reply
        .payload
        .into_iter()
        .next()
        .and_then(Arg::into_entity)
        .ok_or_else(|| ServiceError::bad_request("confirm without saved object"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toasts() {
        assert_eq!(toast(ConfirmCode::Ok, ""), None);
        assert_eq!(
            toast(ConfirmCode::Failed1, "Unknown device type \"rower\"").as_deref(),
            Some("Error: Unknown device type \"rower\"")
        );
        assert_eq!(
            toast(ConfirmCode::Failed2, "").as_deref(),
            Some("Please disconnect all devices before")
        );
        assert_eq!(
            toast(ConfirmCode::Failed3, "anything").as_deref(),
            Some("Timeout waiting for command response")
        );
    }

    #[test]
    fn test_rejection_toast() {
        let err = ServiceError::Rejected {
            code: ConfirmCode::Failed2,
            message: MSG_DISCONNECT_FIRST.to_string(),
        };
        assert_eq!(toast_for(&err), MSG_DISCONNECT_FIRST);
    }

    #[test]
    fn test_listing_decodes_and_rejects_short_rows() {
        let device = Device::new("hrdevice", "AA:BB").with_alias("belt");
        let args = vec![
            Arg::from("0123456789abcdef"),
            Arg::from(Record::Device(device.clone())),
            Arg::from(DeviceState::Online.code()),
            Arg::from(DisconnectReason::Requested.code()),
            Arg::from(r#"{"battery":80}"#),
        ];
        let listing = DeviceListing::from_args(args).unwrap();
        assert_eq!(listing.device, device);
        assert_eq!(listing.state, DeviceState::Online);
        assert_eq!(listing.info.battery, Some(80));

        assert!(DeviceListing::from_args(vec![Arg::from("0123456789abcdef")]).is_none());
    }
}
