use clap::ValueEnum;

pub mod ble;

pub use ble::BleTransport;

/// Link used to reach the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Bluetooth LE GATT
    Ble,
    /// In-process simulated adapter
    Sim,
}
