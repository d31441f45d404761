use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{PadError, Result},
    protocol::hex_list,
    transport::{NotificationStream, Transport},
    types::{ConnectionParams, DeviceInfo},
    WALKINGPAD_NOTIFY_CHAR_UUID, WALKINGPAD_WRITE_CHAR_UUID,
};

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| PadError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// Pick the notify and write characteristics out of everything discovered
fn pick_characteristics<C>(
    found: impl IntoIterator<Item = (Uuid, C)>,
    notify_uuid: Uuid,
    write_uuid: Uuid,
) -> Result<(C, C)> {
    let mut notify = None;
    let mut write = None;
    for (uuid, characteristic) in found {
        if uuid == notify_uuid {
            notify = Some(characteristic);
        } else if uuid == write_uuid {
            write = Some(characteristic);
        }
    }

    let notify =
        notify.ok_or_else(|| PadError::Protocol("Notify characteristic fe01 not found".to_string()))?;
    let write =
        write.ok_or_else(|| PadError::Protocol("Write characteristic fe02 not found".to_string()))?;
    Ok((notify, write))
}

/// Finds WalkingPad belts on the first Bluetooth adapter
pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`PadError::DeviceNotFound`] if there is no adapter, or
    /// [`PadError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PadError::DeviceNotFound)?;
        Ok(Self { adapter })
    }

    /// Scan for `params.scan_timeout_ms` and list matching belts
    ///
    /// A peripheral matches when its address equals `params.address`, or,
    /// without an explicit address, when its name contains
    /// `params.name_filter` (case-insensitive) and its address starts with
    /// `params.address_filter` if one is set. Candidates are sorted by
    /// signal strength, strongest first.
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Ble`] if scanning fails.
    pub async fn scan(&self, params: &ConnectionParams) -> Result<Vec<(DeviceInfo, Peripheral)>> {
        info!("Scanning for peripherals...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        self.adapter.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let info = DeviceInfo::new(
                properties.local_name.unwrap_or_default(),
                peripheral.address().to_string(),
                properties.rssi.unwrap_or(0),
            );
            debug!("Device: {} {} rssi {}", info.address, info.name, info.rssi);

            if Self::matches(&info, params) {
                info!("Found WalkingPad candidate: {} ({})", info.name, info.address);
                candidates.push((info, peripheral));
            }
        }

        if candidates.is_empty() {
            warn!("Scanning ended up with no results");
        }
        candidates.sort_by(|a, b| b.0.rssi.cmp(&a.0.rssi));
        Ok(candidates)
    }

    fn matches(info: &DeviceInfo, params: &ConnectionParams) -> bool {
        if let Some(address) = &params.address {
            return info.address.eq_ignore_ascii_case(address);
        }
        let name_ok = info
            .name
            .to_lowercase()
            .contains(&params.name_filter.to_lowercase());
        let address_ok = params.address_filter.as_ref().map_or(true, |prefix| {
            info.address
                .to_lowercase()
                .starts_with(&prefix.to_lowercase())
        });
        name_ok && address_ok
    }

    /// Scan and connect to the best candidate
    ///
    /// # Errors
    ///
    /// Returns [`PadError::DeviceNotFound`] if no belt was seen, and
    /// otherwise the errors of [`BleTransport::connect`].
    pub async fn connect_first(&self, params: &ConnectionParams) -> Result<BleTransport> {
        let (info, peripheral) = self
            .scan(params)
            .await?
            .into_iter()
            .next()
            .ok_or(PadError::DeviceNotFound)?;
        BleTransport::connect(peripheral, info, params).await
    }
}

/// Established link to a belt's `fe01`/`fe02` characteristics
pub struct BleTransport {
    peripheral: Peripheral,
    device_info: DeviceInfo,
    notify_char: Characteristic,
    write_char: Characteristic,
}

impl BleTransport {
    /// Connect and locate the notify and write characteristics
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Timeout`] if the link is not up within
    /// `params.connect_timeout_ms`, [`PadError::ConnectionFailed`] if the
    /// link or service discovery fails, or [`PadError::Protocol`] if a
    /// required characteristic is missing.
    pub async fn connect(
        peripheral: Peripheral,
        device_info: DeviceInfo,
        params: &ConnectionParams,
    ) -> Result<Self> {
        info!("Connecting to {} ({})", device_info.name, device_info.address);

        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| PadError::Timeout {
            timeout_ms: params.connect_timeout_ms,
        })?
        .map_err(|e| PadError::ConnectionFailed(e.to_string()))?;

        let (notify_char, write_char) = match Self::discover(&peripheral).await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!("Service discovery failed, dropping link: {}", e);
                if let Err(close_err) = peripheral.disconnect().await {
                    debug!("Disconnect after failed discovery: {}", close_err);
                }
                return Err(e);
            }
        };
        info!("Service enumeration done");
        Ok(Self {
            peripheral,
            device_info,
            notify_char,
            write_char,
        })
    }

    async fn discover(peripheral: &Peripheral) -> Result<(Characteristic, Characteristic)> {
        peripheral
            .discover_services()
            .await
            .map_err(|e| PadError::ConnectionFailed(e.to_string()))?;

        let notify_uuid = parse_uuid(WALKINGPAD_NOTIFY_CHAR_UUID, "notify characteristic")?;
        let write_uuid = parse_uuid(WALKINGPAD_WRITE_CHAR_UUID, "write characteristic")?;

        let mut found = Vec::new();
        for service in peripheral.services() {
            debug!("[Service] {}", service.uuid);
            for characteristic in service.characteristics {
                debug!(
                    "\t[Characteristic] {}: {:?}",
                    characteristic.uuid, characteristic.properties
                );
                found.push((characteristic.uuid, characteristic));
            }
        }
        pick_characteristics(found, notify_uuid, write_uuid)
    }

    /// Scanned information about the connected belt
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        debug!("Writing to fe02: {}", hex_list(frame));
        self.peripheral
            .write(&self.write_char, frame, WriteType::WithoutResponse)
            .await
            .map_err(|e| PadError::transport("write", e))
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        info!("Enabling notification for {}", self.notify_char.uuid);
        self.peripheral
            .subscribe(&self.notify_char)
            .await
            .map_err(|e| PadError::transport("subscribe", e))?;

        let notify_uuid = self.notify_char.uuid;
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| PadError::transport("subscribe", e))?;

        Ok(stream
            .filter_map(move |n| async move { (n.uuid == notify_uuid).then_some(n.value) })
            .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}", self.device_info.address);
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
