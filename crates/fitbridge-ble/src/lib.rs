//! BLE driver surface for fitbridge
//!
//! Device managers talk to an event-driven [`BleDriver`]. This crate provides
//! three of them:
//!
//! - [`LocalBleDriver`] - the host's first adapter, via btleplug
//! - [`RemoteBleClient`] - a driver living in another process, reached over
//!   an OSC hop served by [`RemoteBleServer`]
//! - `MockDriver` - a scripted driver for tests (feature `testing`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fitbridge_ble::{BleDriver, LocalBleDriver, ScanFilter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = LocalBleDriver::new().await?;
//! let mut events = driver.events();
//! driver
//!     .start_scan("0123456789abcdef", ScanFilter::default().with_manufacturer(0x0102))
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod driver;
mod error;
mod local;
mod remote;
mod types;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

// Public API exports
pub use driver::{BleDriver, DriverCall, EVENT_CAPACITY};
pub use error::{BleDriverError, Result};
pub use local::LocalBleDriver;
pub use remote::{RemoteBleClient, RemoteBleServer};
pub use types::{
    uuid16, DriverEvent, FoundDevice, GattCharacteristic, GattDescriptor, GattService,
    ManufacturerData, ScanFilter, CCCD_UUID, GATT_FAILURE, GATT_SUCCESS, STATE_CONNECTED,
    STATE_CONNECTING, STATE_DISCONNECTED, STATE_DISCONNECTING,
};

#[cfg(any(test, feature = "testing"))]
pub use mock::MockDriver;
