use anyhow::{Result, anyhow, bail};
use blecan::TransportError;
use blecan::inbound::{self, DEFAULT_CHANNEL_CAPACITY};
use blecan::session::{Session, Transport};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DeviceConfig;

/// A peripheral seen during a scan.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

impl Discovered {
    /// Advertised name or service list suggests an OBD dongle.
    pub fn looks_like_adapter(&self, cfg: &DeviceConfig) -> bool {
        let by_name = self.name.as_deref().is_some_and(|n| {
            let n = n.to_ascii_uppercase();
            n == cfg.name.to_ascii_uppercase() || n.contains("OBD") || n.contains("ELM")
        });
        by_name || self.services.iter().any(|s| *s == cfg.write_uuid || *s == cfg.notify_uuid)
    }
}

pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    write_type: WriteType,
    notify_task: JoinHandle<()>,
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.notify_task.abort();
    }
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.write_char, frame, self.write_type)
            .await
            .map_err(|e| match e {
                btleplug::Error::NotConnected => TransportError::Disconnected,
                other => TransportError::Write(other.to_string()),
            })
    }
}

impl BleTransport {
    pub async fn disconnect(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
    }
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

async fn scan_peripherals(adapter: &Adapter, secs: u64) -> Result<Vec<(Peripheral, Discovered)>> {
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(Duration::from_secs(secs)).await;
    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "stop_scan failed");
    }

    let mut found = Vec::new();
    for p in adapter.peripherals().await? {
        let Some(props) = p.properties().await? else {
            continue;
        };
        let info = Discovered {
            id: format!("{}", p.id()),
            address: props.address.to_string(),
            name: props.local_name,
            rssi: props.rssi,
            services: props.services,
        };
        found.push((p, info));
    }
    Ok(found)
}

pub async fn scan(secs: u64) -> Result<Vec<Discovered>> {
    let adapter = first_adapter().await?;
    info!(secs, "scanning for BLE devices");
    Ok(scan_peripherals(&adapter, secs)
        .await?
        .into_iter()
        .map(|(_, info)| info)
        .collect())
}

fn select(found: Vec<(Peripheral, Discovered)>, cfg: &DeviceConfig) -> Result<Peripheral> {
    if let Some(target) = cfg.address.as_deref() {
        return found
            .into_iter()
            .find(|(_, d)| d.address.eq_ignore_ascii_case(target) || d.id == target)
            .map(|(p, _)| p)
            .ok_or_else(|| anyhow!("'{}' not found", target));
    }
    found
        .into_iter()
        .find(|(_, d)| d.name.as_deref() == Some(cfg.name.as_str()))
        .map(|(p, d)| {
            info!(address = %d.address, name = %cfg.name, "using adapter");
            p
        })
        .ok_or_else(|| anyhow!("No device named '{}' found", cfg.name))
}

/// Scans, connects, subscribes to notifications and returns a session bound to the adapter.
pub async fn open(cfg: &DeviceConfig) -> Result<Session<BleTransport>> {
    let adapter = first_adapter().await?;
    let found = scan_peripherals(&adapter, cfg.scan_secs).await?;
    let dev = select(found, cfg)?;

    dev.connect().await?;
    dev.discover_services().await?;

    let chars = dev.characteristics();
    let find = |uuid: Uuid| chars.iter().find(|c| c.uuid == uuid).cloned();
    let Some(write_char) = find(cfg.write_uuid) else {
        bail!("write characteristic {} not found", cfg.write_uuid);
    };
    let Some(notify_char) = find(cfg.notify_uuid) else {
        bail!("notify characteristic {} not found", cfg.notify_uuid);
    };
    dev.subscribe(&notify_char).await?;

    let session_config = cfg.session_config();
    let (tx, inbound) = inbound::channel(DEFAULT_CHANNEL_CAPACITY, session_config.max_buffer);
    let notify_task = spawn_forwarder(&dev, cfg.notify_uuid, tx).await?;
    // Notifications sent before the adapter finished enabling them are lost.
    sleep(cfg.notify_settle()).await;

    let write_type = if cfg.write_with_response {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    };
    info!(?write_type, "connected");

    let transport = BleTransport {
        peripheral: dev,
        write_char,
        write_type,
        notify_task,
    };
    Ok(Session::new(transport, inbound, session_config))
}

/// Pushes every notification value from `uuid` into the session's inbound channel.
async fn spawn_forwarder(
    dev: &Peripheral,
    uuid: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<JoinHandle<()>> {
    let mut notifications = dev.notifications().await?;
    Ok(tokio::spawn(async move {
        while let Some(n) = notifications.next().await {
            if n.uuid != uuid {
                continue;
            }
            if tx.send(n.value).await.is_err() {
                break;
            }
        }
        debug!("notification stream ended");
    }))
}
