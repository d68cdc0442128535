//! OSC address constants
//!
//! Every message exchanged between the frontend, the backend service and the
//! BLE driver endpoint is addressed by one of these paths.

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

pub const PING: &str = "/ping";
pub const CONFIRM: &str = "/confirm";
pub const PRINTMSG: &str = "/printmsg";

// ----------------------------------------------------------------------------
// Service Commands
// ----------------------------------------------------------------------------

pub const STOP: &str = "/stop";
pub const LOGLEVEL: &str = "/loglevel";
pub const NEWDEVICE: &str = "/newdevice";
pub const VIEW_CONNECT: &str = "/view_connect";
pub const VIEW_DISCONNECT: &str = "/view_disconnect";
pub const SERVE_CONNECTORS: &str = "/serve_connectors";
pub const LISTDEVICES: &str = "/listdevices";
pub const LISTDEVICES_RV: &str = "/listdevices_rv";
pub const LISTUSERS: &str = "/listusers";
pub const LISTUSERS_RV: &str = "/listusers_rv";
pub const LISTVIEWS: &str = "/listviews";
pub const LISTVIEWS_RV: &str = "/listviews_rv";
pub const SAVEVIEW: &str = "/saveview";
pub const DELVIEW: &str = "/delview";
pub const SAVEUSER: &str = "/saveuser";
pub const DELUSER: &str = "/deluser";

// ----------------------------------------------------------------------------
// Device Manager
// ----------------------------------------------------------------------------

pub const DEVICE_SAVE: &str = "/device_save";
pub const DEVICE_DEL: &str = "/device_del";
pub const DEVICE_SEARCH: &str = "/device_search";
pub const DEVICE_FOUND: &str = "/device_found";
pub const DEVICE_STATE: &str = "/device_state";
pub const DEVICE_FIT: &str = "/device_fit";
pub const DEVICE_SESSION: &str = "/device_session";

// ----------------------------------------------------------------------------
// Remote BLE Driver
// ----------------------------------------------------------------------------

/// Driver calls, client to driver endpoint
pub mod wbd {
    pub const START_SCAN: &str = "/wbd_start_scan";
    pub const STOP_SCAN: &str = "/wbd_stop_scan";
    pub const CONNECT_GATT: &str = "/wbd_connect_gatt";
    pub const CLOSE_GATT: &str = "/wbd_close_gatt";
    pub const DISCOVER_SERVICES: &str = "/wbd_discover_services";
    pub const ENABLE_NOTIFICATIONS: &str = "/wbd_enable_notifications";
    pub const READ_CHARACTERISTIC: &str = "/wbd_read_characteristic";
    pub const WRITE_CHARACTERISTIC: &str = "/wbd_write_characteristic";
    pub const WRITE_DESCRIPTOR: &str = "/wbd_write_descriptor";

    // driver events, driver endpoint to client
    pub const DEVICE_FOUND: &str = "/wbd_device_found";
    pub const CONNECTION_STATE_CHANGE: &str = "/wbd_connection_state_change";
    pub const SERVICES: &str = "/wbd_services";
    pub const CHARACTERISTIC_CHANGED: &str = "/wbd_characteristic_changed";
    pub const CHARACTERISTIC_READ: &str = "/wbd_characteristic_read";
    pub const CHARACTERISTIC_WRITE: &str = "/wbd_characteristic_write";
    pub const DESCRIPTOR_READ: &str = "/wbd_descriptor_read";
    pub const DESCRIPTOR_WRITE: &str = "/wbd_descriptor_write";
    pub const GATT_RELEASE: &str = "/wbd_gatt_release";
    pub const SCAN_STARTED: &str = "/wbd_scan_started";
    pub const SCAN_COMPLETED: &str = "/wbd_scan_completed";
    pub const OPERATION_FAILED: &str = "/wbd_operation_failed";

    pub const CALLS: [&str; 9] = [
        START_SCAN,
        STOP_SCAN,
        CONNECT_GATT,
        CLOSE_GATT,
        DISCOVER_SERVICES,
        ENABLE_NOTIFICATIONS,
        READ_CHARACTERISTIC,
        WRITE_CHARACTERISTIC,
        WRITE_DESCRIPTOR,
    ];

    pub const EVENTS: [&str; 12] = [
        DEVICE_FOUND,
        CONNECTION_STATE_CHANGE,
        SERVICES,
        CHARACTERISTIC_CHANGED,
        CHARACTERISTIC_READ,
        CHARACTERISTIC_WRITE,
        DESCRIPTOR_READ,
        DESCRIPTOR_WRITE,
        GATT_RELEASE,
        SCAN_STARTED,
        SCAN_COMPLETED,
        OPERATION_FAILED,
    ];
}
