//! btleplug 传输实现
//!
//! 流程:
//! 1. 在已知外设中按 MAC 地址查找，找不到时扫描直到超时
//! 2. 连接并发现服务
//! 3. 定位命令特征和状态特征
//! 4. 监听适配器事件，设备断开时取消 `lost` 令牌
//!
//! 扫描是适配器级别的。`presence()` 持有扫描期间，连接时的查找
//! 既不重复启动扫描，也不停止它。

use crate::ble::transport::{Link, NotificationStream, Transport, TransportError};
use crate::ble::{Channel, MANUFACTURER_ID};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, trace, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::LinkLost,
            btleplug::Error::TimedOut(d) => TransportError::Timeout(format!("{:?}", d)),
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound("unknown".into()),
            btleplug::Error::InvalidBDAddr(e) => TransportError::InvalidAddress(e.to_string()),
            btleplug::Error::NotSupported(what) => TransportError::Unsupported(what),
            btleplug::Error::PermissionDenied => {
                TransportError::Unsupported("permission denied".into())
            }
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// 记录持续扫描的持有者
#[derive(Debug, Clone, Default)]
struct ScanOwnership {
    watchers: Arc<AtomicUsize>,
}

impl ScanOwnership {
    fn watch(&self) -> PresenceWatch {
        self.watchers.fetch_add(1, Ordering::SeqCst);
        PresenceWatch {
            watchers: Arc::clone(&self.watchers),
        }
    }

    /// 没有存在检测在使用扫描时，查找设备需要自行启动和停止扫描
    fn owned_by_lookup(&self) -> bool {
        self.watchers.load(Ordering::SeqCst) == 0
    }
}

/// 存在检测流持有，流被 drop 时释放
#[derive(Debug)]
struct PresenceWatch {
    watchers: Arc<AtomicUsize>,
}

impl Drop for PresenceWatch {
    fn drop(&mut self) {
        self.watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 已连接外设的句柄
#[derive(Debug, Clone)]
pub struct BtleHandle {
    pub address: String,
    peripheral: Peripheral,
    command: Characteristic,
    status: Characteristic,
}

impl BtleHandle {
    fn characteristic(&self, channel: Channel) -> &Characteristic {
        match channel {
            Channel::Command => &self.command,
            Channel::Status => &self.status,
        }
    }
}

pub struct BtleTransport {
    adapter: Adapter,
    connect_timeout: Duration,
    io_timeout: Duration,
    scan: ScanOwnership,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        if let Ok(info) = adapter.adapter_info().await {
            debug!("Using Bluetooth adapter {}", info);
        }

        Ok(Self {
            adapter,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            scan: ScanOwnership::default(),
        })
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// 设备出现在广播中时产生一个事件
    ///
    /// 用于在设备重新进入范围时触发刷新。会启动一次持续扫描，
    /// 流存活期间扫描不会被连接流程停止。
    pub async fn presence(&self, address: &str) -> Result<BoxStream<'static, ()>, TransportError> {
        let target = parse_address(address)?;
        let adapter = self.adapter.clone();
        let events = self.adapter.events().await?;
        let watch = self.scan.watch();
        self.adapter.start_scan(ScanFilter::default()).await?;

        let stream = events.filter_map(move |event| {
            let _watch = &watch;
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    CentralEvent::ManufacturerDataAdvertisement {
                        id,
                        manufacturer_data,
                    } if manufacturer_data.contains_key(&MANUFACTURER_ID) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok()??;
                (props.address == target).then_some(())
            }
        });
        Ok(stream.boxed())
    }

    async fn locate(&self, address: &str) -> Result<Peripheral, TransportError> {
        let target = parse_address(address)?;

        if let Some(peripheral) = self.find_known(target).await? {
            return Ok(peripheral);
        }

        let owns_scan = self.scan.owned_by_lookup();
        if owns_scan {
            info!("Scanning for {}", address);
            self.adapter.start_scan(ScanFilter::default()).await?;
        } else {
            debug!("Waiting for {} on the running scan", address);
        }
        let scan = async {
            loop {
                time::sleep(SCAN_POLL_INTERVAL).await;
                match self.find_known(target).await {
                    Ok(Some(peripheral)) => return Ok(peripheral),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }
        };
        let found = time::timeout(self.connect_timeout, scan).await;
        if owns_scan && self.scan.owned_by_lookup() {
            if let Err(e) = self.adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(TransportError::DeviceNotFound(address.to_string())),
        }
    }

    async fn find_known(&self, target: BDAddr) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if props.address == target {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        channel: Channel,
    ) -> Result<Characteristic, TransportError> {
        let uuid = channel.characteristic_uuid();
        for service in peripheral.services() {
            if service.uuid == channel.service_uuid() {
                for characteristic in service.characteristics {
                    if characteristic.uuid == uuid {
                        return Ok(characteristic);
                    }
                }
            }
        }
        Err(TransportError::CharacteristicNotFound(uuid))
    }

    async fn with_timeout<T, F>(
        &self,
        what: &str,
        limit: Duration,
        fut: F,
    ) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, btleplug::Error>>,
    {
        match time::timeout(limit, fut).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout(what.to_string())),
        }
    }

    /// 适配器报告设备断开时取消 `lost`
    async fn watch_disconnect(
        &self,
        peripheral: &Peripheral,
        lost: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = lost.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            debug!("Adapter reported disconnect of {:?}", gone);
                            lost.cancel();
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended, treating link as lost");
                            lost.cancel();
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<BDAddr, TransportError> {
    BDAddr::from_str_delim(address).map_err(|_| TransportError::InvalidAddress(address.to_string()))
}

#[async_trait]
impl Transport for BtleTransport {
    type Handle = BtleHandle;

    async fn connect(
        &self,
        address: &str,
        lost: CancellationToken,
    ) -> Result<Link<BtleHandle>, TransportError> {
        let peripheral = self.locate(address).await?;

        info!("Connecting to {}", address);
        if !peripheral.is_connected().await? {
            self.with_timeout("connect", self.connect_timeout, peripheral.connect())
                .await?;
        }

        debug!("Discovering services...");
        self.with_timeout(
            "discover services",
            self.connect_timeout,
            peripheral.discover_services(),
        )
        .await?;

        let command = Self::find_characteristic(&peripheral, Channel::Command)?;
        let status = Self::find_characteristic(&peripheral, Channel::Status)?;
        let name = peripheral
            .properties()
            .await?
            .and_then(|props| props.local_name);

        self.watch_disconnect(&peripheral, lost).await?;

        Ok(Link {
            handle: BtleHandle {
                address: address.to_string(),
                peripheral,
                command,
                status,
            },
            name,
        })
    }

    async fn write(
        &self,
        handle: &BtleHandle,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), TransportError> {
        trace!("Writing {} bytes to {}", data.len(), channel);
        self.with_timeout(
            "write",
            self.io_timeout,
            handle.peripheral.write(
                handle.characteristic(channel),
                data,
                WriteType::WithResponse,
            ),
        )
        .await
    }

    async fn read(&self, handle: &BtleHandle, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let data = self
            .with_timeout(
                "read",
                self.io_timeout,
                handle.peripheral.read(handle.characteristic(channel)),
            )
            .await?;
        trace!("Read {} bytes from {}", data.len(), channel);
        Ok(data)
    }

    async fn subscribe(
        &self,
        handle: &BtleHandle,
        channel: Channel,
    ) -> Result<NotificationStream, TransportError> {
        let characteristic = handle.characteristic(channel).clone();
        self.with_timeout(
            "subscribe",
            self.io_timeout,
            handle.peripheral.subscribe(&characteristic),
        )
        .await?;

        let uuid = characteristic.uuid;
        let notifications = handle.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == uuid).then_some(n.value) })
            .boxed())
    }

    async fn disconnect(&self, handle: &BtleHandle) -> Result<(), TransportError> {
        if handle.peripheral.is_connected().await? {
            info!("Disconnecting from {}", handle.address);
            self.with_timeout("disconnect", self.io_timeout, handle.peripheral.disconnect())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr = parse_address("00:80:E1:22:43:0D").unwrap();
        assert_eq!(addr.to_string(), "00:80:E1:22:43:0D");

        assert!(matches!(
            parse_address("not-a-mac"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_presence_watch_keeps_scan() {
        let scan = ScanOwnership::default();
        assert!(scan.owned_by_lookup());

        let first = scan.watch();
        let second = scan.watch();
        assert!(!scan.owned_by_lookup());

        drop(first);
        assert!(!scan.owned_by_lookup());
        drop(second);
        assert!(scan.owned_by_lookup());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            TransportError::from(btleplug::Error::NotConnected),
            TransportError::LinkLost
        );
        assert!(
            TransportError::from(btleplug::Error::TimedOut(Duration::from_secs(1))).is_transient()
        );
        assert!(!TransportError::from(btleplug::Error::PermissionDenied).is_transient());
        assert!(TransportError::from(btleplug::Error::Other("hci busy".into())).is_transient());
    }
}
