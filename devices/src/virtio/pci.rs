// Copyright 2021 Computer Architecture and Systems Lab
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::tys::{DeviceType, IsrStatus, PciCapabilityType, Status, VirtIoFeaturesCommon};
use super::virt_queue::{QueueArea, RingFormat, RingState, VirtQueue};
use super::worker::Worker;
use super::{QueueError, TransportConfig, VirtioBackend, VirtioError};
use crate::bus::{BusDevice, IoDispatch, IoSpace};
use crate::event::EventChannel;
use crate::pci::{
    BarChange, BarKind, PciConfigSpace, PciDevice, PciHeaderInfo, CAP_ID_VENDOR, VIRTIO_VENDOR_ID,
};
use crossbeam_utils::CachePadded;
use memory::{Gpa, GuestAddressSpace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Placement of the virtio structures.
pub mod layout {
    /// BAR0 offset of the common configuration.
    pub const COMMON_CFG_OFFSET: u64 = 0x0000;
    pub const COMMON_CFG_LEN: u64 = 0x38;
    /// BAR0 offset of the ISR status.
    pub const ISR_CFG_OFFSET: u64 = 0x1000;
    pub const ISR_CFG_LEN: u64 = 0x4;
    /// BAR0 offset of the device specific configuration.
    pub const DEVICE_CFG_OFFSET: u64 = 0x2000;
    pub const DEVICE_CFG_MAX: u64 = 0x1000;
    /// BAR0 offset of the notify window.
    pub const NOTIFY_CFG_OFFSET: u64 = 0x3000;
    pub const NOTIFY_CFG_MAX: u64 = 0x1000;
    pub const BAR0_SIZE: u64 = 0x4000;

    // 4.1.4.3 Common configuration structure layout
    /// The driver uses this to select which feature bits device_feature shows. Value 0x0 selects Feature Bits 0 to 31, 0x1 selects Feature Bits 32 to 63, etc.
    pub const DEVICE_FEATURE_SELECT: u64 = 0;
    /// The device uses this to report which feature bits it is offering to the driver.
    pub const DEVICE_FEATURE: u64 = 4;
    /// The driver uses this to select which feature bits driver_feature shows.
    pub const DRIVER_FEATURE_SELECT: u64 = 8;
    /// The driver writes this to accept feature bits offered by the device.
    pub const DRIVER_FEATURE: u64 = 12;
    /// The driver sets the Configuration Vector for MSI-X.
    pub const MSIX_CONFIG: u64 = 16;
    /// The device specifies the maximum number of virtqueues supported here.
    pub const NUM_QUEUES: u64 = 18;
    /// The driver writes the device status here. Writing 0 into this field resets the device.
    pub const DEVICE_STATUS: u64 = 20;
    /// Configuration atomicity value. The device changes this every time the configuration noticeably changes.
    pub const CONFIG_GENERATION: u64 = 21;
    /// The driver selects which virtqueue the following fields refer to.
    pub const QUEUE_SELECT: u64 = 22;
    /// On reset, specifies the maximum queue size supported by the device. A 0 means the queue is unavailable.
    pub const QUEUE_SIZE: u64 = 24;
    /// The driver uses this to specify the queue vector for MSI-X.
    pub const QUEUE_MSIX_VECTOR: u64 = 26;
    /// 1 - enabled; 0 - disabled.
    pub const QUEUE_ENABLE: u64 = 28;
    /// Offset from start of Notification structure at which this virtqueue is located, in multiples of notify_off_multiplier.
    pub const QUEUE_NOTIFY_OFF: u64 = 30;
    /// The driver writes the physical address of Descriptor Area here.
    pub const QUEUE_DESC: u64 = 32;
    /// The driver writes the physical address of Driver Area here.
    pub const QUEUE_DRIVER: u64 = 40;
    /// The driver writes the physical address of Device Area here.
    pub const QUEUE_DEVICE: u64 = 48;

    // struct virtio_pci_cap, relative to the capability.
    pub const CAP_LEN: usize = 2;
    pub const CAP_CFG_TYPE: usize = 3;
    pub const CAP_BAR: usize = 4;
    pub const CAP_OFFSET: usize = 8;
    pub const CAP_LENGTH: usize = 12;
    pub const CAP_NOTIFY_MULTIPLIER: usize = 16;
    pub const CAP_PCI_CFG_DATA: usize = 16;
}
use layout::*;

/// MSI-X is not implemented.
const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

/// Common configuration state outside of the queues.
struct Common {
    device_feature_select: u32,
    driver_feature_select: u32,
    driver_features: u64,
    queue_select: u16,
    config_generation: u8,
    worker: Option<Worker>,
}

/// State shared by the vCPU threads and the worker.
pub(crate) struct Transport {
    pub(crate) device_type: DeviceType,
    offered: u64,
    multiplier: u32,
    config_len: usize,
    status: CachePadded<AtomicU8>,
    pub(crate) isr: CachePadded<AtomicU8>,
    common: Mutex<Common>,
    pub(crate) queues: Vec<Mutex<VirtQueue>>,
    pub(crate) backend: Mutex<Box<dyn VirtioBackend>>,
    pub(crate) memory: Arc<GuestAddressSpace>,
    pub(crate) notify: EventChannel,
    pub(crate) interrupt: EventChannel,
    pub(crate) running: AtomicBool,
}

fn le_value(data: &[u8]) -> u64 {
    let mut b = [0; 8];
    let n = data.len().min(8);
    b[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(b)
}

impl Transport {
    #[inline]
    pub(crate) fn status(&self) -> Status {
        Status::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// The driver broke the protocol; give up on the device.
    pub(crate) fn fail(&self, err: &QueueError) {
        log::error!("virtio-{:?}: {}; device failed", self.device_type, err);
        self.status.fetch_or(Status::FAILED.bits(), Ordering::AcqRel);
        self.isr
            .fetch_or(IsrStatus::DEVICE_CONFIGURATION_INTERRUPT.bits(), Ordering::AcqRel);
        if let Err(e) = self.interrupt.signal() {
            log::error!("virtio-{:?}: failed to signal interrupt: {}", self.device_type, e);
        }
    }

    fn common_read(&self, offset: u64, data: &mut [u8]) {
        let mut regs = [0u8; COMMON_CFG_LEN as usize];
        let mut put = |off: u64, bytes: &[u8]| {
            regs[off as usize..off as usize + bytes.len()].copy_from_slice(bytes)
        };
        let common = self.common.lock();
        let features = match common.device_feature_select {
            0 => self.offered as u32,
            1 => (self.offered >> 32) as u32,
            _ => 0,
        };
        let driver_features = match common.driver_feature_select {
            0 => common.driver_features as u32,
            1 => (common.driver_features >> 32) as u32,
            _ => 0,
        };
        put(DEVICE_FEATURE_SELECT, &common.device_feature_select.to_le_bytes());
        put(DEVICE_FEATURE, &features.to_le_bytes());
        put(DRIVER_FEATURE_SELECT, &common.driver_feature_select.to_le_bytes());
        put(DRIVER_FEATURE, &driver_features.to_le_bytes());
        put(MSIX_CONFIG, &VIRTIO_MSI_NO_VECTOR.to_le_bytes());
        put(NUM_QUEUES, &(self.queues.len() as u16).to_le_bytes());
        put(DEVICE_STATUS, &[self.status().bits()]);
        put(CONFIG_GENERATION, &[common.config_generation]);
        put(QUEUE_SELECT, &common.queue_select.to_le_bytes());
        put(QUEUE_MSIX_VECTOR, &VIRTIO_MSI_NO_VECTOR.to_le_bytes());
        if let Some(q) = self.queues.get(common.queue_select as usize) {
            let q = q.lock();
            put(QUEUE_SIZE, &q.size().to_le_bytes());
            put(QUEUE_ENABLE, &(q.is_enabled() as u16).to_le_bytes());
            put(QUEUE_NOTIFY_OFF, &q.index().to_le_bytes());
            put(QUEUE_DESC, &q.area(QueueArea::Desc).as_u64().to_le_bytes());
            put(QUEUE_DRIVER, &q.area(QueueArea::Driver).as_u64().to_le_bytes());
            put(QUEUE_DEVICE, &q.area(QueueArea::Device).as_u64().to_le_bytes());
        }
        drop(common);

        let start = offset as usize;
        match start.checked_add(data.len()) {
            Some(end) if end <= regs.len() => data.copy_from_slice(&regs[start..end]),
            _ => data.fill(0),
        }
    }

    fn common_write(self: &Arc<Self>, offset: u64, data: &[u8]) {
        let v = le_value(data);
        if offset == DEVICE_STATUS && data.len() == 1 {
            self.write_status(v as u8);
            return;
        }
        let mut common = self.common.lock();
        match (offset, data.len()) {
            (DEVICE_FEATURE_SELECT, 4) => common.device_feature_select = v as u32,
            (DRIVER_FEATURE_SELECT, 4) => common.driver_feature_select = v as u32,
            (DRIVER_FEATURE, 4) => {
                if self.status().contains(Status::FEATURES_OK) {
                    log::warn!("virtio-{:?}: driver features written after FEATURES_OK", self.device_type);
                    return;
                }
                match common.driver_feature_select {
                    0 => common.driver_features = (common.driver_features & !0xffff_ffff) | v,
                    1 => common.driver_features = (common.driver_features & 0xffff_ffff) | (v << 32),
                    _ => (),
                }
            }
            (QUEUE_SELECT, 2) => common.queue_select = v as u16,
            (MSIX_CONFIG, 2) | (QUEUE_MSIX_VECTOR, 2) => (),
            (QUEUE_SIZE, 2) | (QUEUE_ENABLE, 2) | (QUEUE_DESC..=0x37, _) => {
                self.queue_write(&common, offset, data.len(), v)
            }
            _ => log::warn!(
                "virtio-{:?}: ignored common config write of {} bytes at {:#x}",
                self.device_type,
                data.len(),
                offset
            ),
        }
    }

    fn queue_write(&self, common: &Common, offset: u64, len: usize, v: u64) {
        if self.status().contains(Status::DRIVER_OK) {
            log::warn!("virtio-{:?}: queue configured after DRIVER_OK", self.device_type);
            return;
        }
        let mut q = match self.queues.get(common.queue_select as usize) {
            Some(q) => q.lock(),
            None => return,
        };
        let accepted = match (offset, len) {
            (QUEUE_SIZE, _) => q.set_size(v as u16),
            (QUEUE_ENABLE, _) if v == 1 => {
                if !self.status().contains(Status::FEATURES_OK) {
                    false
                } else {
                    let format = if common.driver_features & VirtIoFeaturesCommon::RING_PACKED.bits() != 0 {
                        RingFormat::Packed
                    } else {
                        RingFormat::Split
                    };
                    match q.enable(format, &self.memory) {
                        Ok(()) => {
                            log::debug!("virtio-{:?}: {:?}", self.device_type, *q);
                            true
                        }
                        Err(e) => {
                            log::warn!("virtio-{:?}: queue {} not enabled: {}", self.device_type, q.index(), e);
                            return;
                        }
                    }
                }
            }
            (QUEUE_ENABLE, _) => false,
            (off, len) => {
                let (area, field) = match off {
                    QUEUE_DESC..=0x27 => (QueueArea::Desc, off - QUEUE_DESC),
                    QUEUE_DRIVER..=0x2f => (QueueArea::Driver, off - QUEUE_DRIVER),
                    _ => (QueueArea::Device, off - QUEUE_DEVICE),
                };
                let cur = q.area(area).as_u64();
                let addr = match (field, len) {
                    (0, 8) => Some(v),
                    (0, 4) => Some((cur & !0xffff_ffff) | v),
                    (4, 4) => Some((cur & 0xffff_ffff) | (v << 32)),
                    _ => None,
                };
                match addr {
                    Some(addr) => q.set_area(area, Gpa::new(addr)),
                    None => false,
                }
            }
        };
        if !accepted {
            log::warn!(
                "virtio-{:?}: ignored write {:#x} to queue {} at {:#x}",
                self.device_type,
                v,
                q.index(),
                offset
            );
        }
    }

    fn write_status(self: &Arc<Self>, val: u8) {
        if val == 0 {
            self.reset();
            return;
        }
        let mut common = self.common.lock();
        let cur = self.status();
        let mut new = cur | Status::from_bits_truncate(val);
        let added = new - cur;

        const ORDER: [Status; 4] = [
            Status::ACKNOWLEDGE,
            Status::DRIVER,
            Status::FEATURES_OK,
            Status::DRIVER_OK,
        ];
        for pair in ORDER.windows(2) {
            if added.contains(pair[1]) && !new.contains(pair[0]) {
                log::warn!("virtio-{:?}: status {:?} without {:?}", self.device_type, pair[1], pair[0]);
                return;
            }
        }
        if added.contains(Status::FEATURES_OK) {
            let accepted = common.driver_features;
            if accepted & !self.offered != 0 || accepted & VirtIoFeaturesCommon::VERSION_1.bits() == 0 {
                log::warn!(
                    "virtio-{:?}: rejecting features {:#x} (offered {:#x})",
                    self.device_type,
                    accepted,
                    self.offered
                );
                new.remove(Status::FEATURES_OK | Status::DRIVER_OK);
            }
        }
        // The worker sets FAILED without the common lock; keep it.
        let prev = match self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(new.bits() | (s & Status::FAILED.bits()))
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        new |= Status::from_bits_truncate(prev) & Status::FAILED;
        if new.contains(Status::DRIVER_OK) && added.contains(Status::DRIVER_OK) && !new.contains(Status::FAILED) {
            log::info!(
                "virtio-{:?}: driver ready, features {:#x}",
                self.device_type,
                common.driver_features
            );
            self.start_worker(&mut common);
        }
    }

    fn start_worker(self: &Arc<Self>, common: &mut Common) {
        if common.worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);
        match Worker::spawn(self.clone()) {
            Ok(worker) => common.worker = Some(worker),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                log::error!("virtio-{:?}: failed to spawn worker: {}", self.device_type, e);
                self.status.fetch_or(Status::FAILED.bits(), Ordering::AcqRel);
            }
        }
    }

    /// Stop the worker and wait until it can no longer touch the rings.
    pub(crate) fn stop_worker(&self) {
        let worker = self.common.lock().worker.take();
        if let Some(worker) = worker {
            self.running.store(false, Ordering::Release);
            if let Err(e) = self.notify.signal() {
                log::error!("virtio-{:?}: failed to wake worker: {}", self.device_type, e);
            }
            worker.join();
        }
    }

    fn reset(&self) {
        self.stop_worker();
        for q in &self.queues {
            q.lock().reset();
        }
        {
            let mut common = self.common.lock();
            common.device_feature_select = 0;
            common.driver_feature_select = 0;
            common.driver_features = 0;
            common.queue_select = 0;
            common.config_generation = common.config_generation.wrapping_add(1);
        }
        self.isr.store(0, Ordering::Release);
        self.status.store(0, Ordering::Release);
        self.backend.lock().reset();
        log::info!("virtio-{:?}: reset", self.device_type);
    }

    fn notify_write(&self, offset: u64, data: &[u8]) {
        let queue = if self.multiplier == 0 {
            le_value(data)
        } else if offset % self.multiplier as u64 == 0 {
            offset / self.multiplier as u64
        } else {
            u64::MAX
        };
        if queue >= self.queues.len() as u64 {
            log::warn!("virtio-{:?}: notify for unknown queue {}", self.device_type, queue);
            return;
        }
        if let Err(e) = self.notify.signal() {
            log::error!("virtio-{:?}: failed to notify worker: {}", self.device_type, e);
        }
    }

    fn device_cfg_read(&self, offset: u64, data: &mut [u8]) {
        match (offset as usize).checked_add(data.len()) {
            Some(end) if end <= self.config_len => self.backend.lock().read_config(offset as usize, data),
            _ => data.fill(0),
        }
    }

    fn device_cfg_write(&self, offset: u64, data: &[u8]) {
        match (offset as usize).checked_add(data.len()) {
            Some(end) if end <= self.config_len => self.backend.lock().write_config(offset as usize, data),
            _ => log::warn!("virtio-{:?}: device config write out of range", self.device_type),
        }
    }

    fn notify_len(&self) -> u64 {
        (self.queues.len() as u64 * self.multiplier as u64).max(2)
    }
}

/// Handler of BAR0.
pub(crate) struct VirtioBar(Arc<Transport>);

impl BusDevice for VirtioBar {
    fn read(&self, offset: u64, data: &mut [u8]) {
        let t = &self.0;
        match offset {
            o if o < COMMON_CFG_OFFSET + COMMON_CFG_LEN => t.common_read(o - COMMON_CFG_OFFSET, data),
            o if (ISR_CFG_OFFSET..ISR_CFG_OFFSET + ISR_CFG_LEN).contains(&o) => {
                data.fill(0);
                if o == ISR_CFG_OFFSET {
                    // Reading clears.
                    if let Some(b) = data.first_mut() {
                        *b = t.isr.swap(0, Ordering::AcqRel);
                    }
                }
            }
            o if (DEVICE_CFG_OFFSET..DEVICE_CFG_OFFSET + DEVICE_CFG_MAX).contains(&o) => {
                t.device_cfg_read(o - DEVICE_CFG_OFFSET, data)
            }
            _ => data.fill(0),
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let t = &self.0;
        match offset {
            o if o < COMMON_CFG_OFFSET + COMMON_CFG_LEN => t.common_write(o - COMMON_CFG_OFFSET, data),
            o if (DEVICE_CFG_OFFSET..DEVICE_CFG_OFFSET + DEVICE_CFG_MAX).contains(&o) => {
                t.device_cfg_write(o - DEVICE_CFG_OFFSET, data)
            }
            o if (NOTIFY_CFG_OFFSET..NOTIFY_CFG_OFFSET + t.notify_len()).contains(&o) => {
                t.notify_write(o - NOTIFY_CFG_OFFSET, data)
            }
            _ => log::trace!("virtio-{:?}: ignored BAR0 write at {:#x}", t.device_type, offset),
        }
    }
}

/// Queue state as seen by the device, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub enabled: bool,
    pub format: RingFormat,
    pub size: u16,
    pub state: RingState,
}

/// A virtio device on the PCI transport.
pub struct VirtioPciDevice {
    transport: Arc<Transport>,
    config: Mutex<PciConfigSpace>,
    bar: Arc<VirtioBar>,
    bar0: Mutex<Option<u64>>,
    pci_cfg_cap: usize,
    irq: u8,
}

fn virtio_cap(cfg_type: PciCapabilityType, offset: u64, length: u64, extra: &[u8]) -> Vec<u8> {
    let mut body = vec![(16 + extra.len()) as u8, cfg_type as u8, 0, 0, 0, 0];
    body.extend_from_slice(&(offset as u32).to_le_bytes());
    body.extend_from_slice(&(length as u32).to_le_bytes());
    body.extend_from_slice(extra);
    body
}

impl VirtioPciDevice {
    /// Wrap `backend` into a PCI function raising legacy line `irq`.
    pub fn new(
        backend: Box<dyn VirtioBackend>,
        memory: Arc<GuestAddressSpace>,
        irq: u8,
        config: TransportConfig,
    ) -> Result<Self, VirtioError> {
        let multiplier = config.notify_multiplier;
        if multiplier != 0 && (multiplier < 2 || !multiplier.is_power_of_two()) {
            return Err(VirtioError::InvalidNotifyMultiplier(multiplier));
        }
        let num_queues = backend.num_queues();
        if num_queues == 0
            || num_queues as u64 * config.notify_multiplier as u64 > NOTIFY_CFG_MAX
        {
            return Err(VirtioError::InvalidQueueCount(num_queues));
        }
        if !config.queue_max_size.is_power_of_two() {
            return Err(VirtioError::InvalidQueueSize(config.queue_max_size));
        }
        let device_type = backend.device_type();
        let offered = backend.features()
            | VirtIoFeaturesCommon::VERSION_1.bits()
            | VirtIoFeaturesCommon::RING_PACKED.bits();
        let config_len = backend.config_len().min(DEVICE_CFG_MAX as usize);

        let mut space = PciConfigSpace::new(PciHeaderInfo {
            vendor_id: VIRTIO_VENDOR_ID,
            device_id: device_type.pci_device_id(),
            revision_id: 1,
            class_code: device_type.pci_class_code(),
            subsystem_vendor_id: VIRTIO_VENDOR_ID,
            subsystem_id: device_type as u16,
            interrupt_pin: 1,
            interrupt_line: irq,
        });
        space.add_bar(0, BarKind::Memory32 { prefetchable: false }, BAR0_SIZE)?;

        let transport = Arc::new(Transport {
            device_type,
            offered,
            multiplier: config.notify_multiplier,
            config_len,
            status: CachePadded::new(AtomicU8::new(0)),
            isr: CachePadded::new(AtomicU8::new(0)),
            common: Mutex::new(Common {
                device_feature_select: 0,
                driver_feature_select: 0,
                driver_features: 0,
                queue_select: 0,
                config_generation: 0,
                worker: None,
            }),
            queues: (0..num_queues)
                .map(|i| Mutex::new(VirtQueue::new(i, config.queue_max_size)))
                .collect(),
            backend: Mutex::new(backend),
            memory,
            notify: EventChannel::new().map_err(VirtioError::Event)?,
            interrupt: EventChannel::new_nonblocking().map_err(VirtioError::Event)?,
            running: AtomicBool::new(false),
        });

        space.add_capability(
            CAP_ID_VENDOR,
            &virtio_cap(PciCapabilityType::CommonCfg, COMMON_CFG_OFFSET, COMMON_CFG_LEN, &[]),
        )?;
        space.add_capability(
            CAP_ID_VENDOR,
            &virtio_cap(
                PciCapabilityType::NotifyCfg,
                NOTIFY_CFG_OFFSET,
                transport.notify_len(),
                &config.notify_multiplier.to_le_bytes(),
            ),
        )?;
        space.add_capability(
            CAP_ID_VENDOR,
            &virtio_cap(PciCapabilityType::IsrCfg, ISR_CFG_OFFSET, ISR_CFG_LEN, &[]),
        )?;
        if config_len > 0 {
            space.add_capability(
                CAP_ID_VENDOR,
                &virtio_cap(PciCapabilityType::DeviceCfg, DEVICE_CFG_OFFSET, config_len as u64, &[]),
            )?;
        }
        let pci_cfg_cap =
            space.add_capability(CAP_ID_VENDOR, &virtio_cap(PciCapabilityType::PciCfg, 0, 0, &[0; 4]))? as usize;
        space.set_writable(pci_cfg_cap + CAP_BAR, 1)?;
        space.set_writable(pci_cfg_cap + CAP_OFFSET, 8)?;

        log::info!(
            "virtio-{:?}: {} queues, features {:#x}, irq {}",
            device_type,
            num_queues,
            offered,
            irq
        );
        Ok(Self {
            bar: Arc::new(VirtioBar(transport.clone())),
            transport,
            config: Mutex::new(space),
            bar0: Mutex::new(None),
            pci_cfg_cap,
            irq,
        })
    }

    #[inline]
    pub fn device_type(&self) -> DeviceType {
        self.transport.device_type
    }

    /// Legacy interrupt line of the device.
    #[inline]
    pub fn irq(&self) -> u8 {
        self.irq
    }

    /// Signalled once per batch of completions; the host injects `irq`.
    #[inline]
    pub fn interrupt(&self) -> &EventChannel {
        &self.transport.interrupt
    }

    /// Wakes the worker; shared by every queue of the device.
    #[inline]
    pub fn notify_event(&self) -> &EventChannel {
        &self.transport.notify
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.transport.status()
    }

    /// Pending ISR bits, without clearing them.
    #[inline]
    pub fn isr(&self) -> IsrStatus {
        IsrStatus::from_bits_truncate(self.transport.isr.load(Ordering::Acquire))
    }

    pub fn queue(&self, index: u16) -> Option<QueueSnapshot> {
        self.transport.queues.get(index as usize).map(|q| {
            let q = q.lock();
            QueueSnapshot {
                enabled: q.is_enabled(),
                format: q.format(),
                size: q.size(),
                state: q.state(),
            }
        })
    }

    /// Guest address of the notify register of `queue`, once BAR0 decodes.
    pub fn notify_address(&self, queue: u16) -> Option<u64> {
        let base = (*self.bar0.lock())?;
        if queue as usize >= self.transport.queues.len() {
            return None;
        }
        Some(base + NOTIFY_CFG_OFFSET + queue as u64 * self.transport.multiplier as u64)
    }

    fn notify_addresses(&self, base: u64) -> Vec<u64> {
        let t = &self.transport;
        if t.multiplier == 0 {
            vec![base + NOTIFY_CFG_OFFSET]
        } else {
            (0..t.queues.len() as u64)
                .map(|i| base + NOTIFY_CFG_OFFSET + i * t.multiplier as u64)
                .collect()
        }
    }

    /// The device specific configuration changed.
    pub fn notify_config_changed(&self) {
        let t = &self.transport;
        {
            let mut common = t.common.lock();
            common.config_generation = common.config_generation.wrapping_add(1);
        }
        t.isr
            .fetch_or(IsrStatus::DEVICE_CONFIGURATION_INTERRUPT.bits(), Ordering::AcqRel);
        if let Err(e) = t.interrupt.signal() {
            log::error!("virtio-{:?}: failed to signal interrupt: {}", t.device_type, e);
        }
    }

    /// Stop the worker. The device keeps answering register accesses.
    pub fn shutdown(&self) {
        self.transport.stop_worker();
    }

    /// BAR0 window addressed by the PCI configuration access capability.
    fn pci_cfg_window(&self) -> Option<(u64, usize)> {
        let config = self.config.lock();
        let cap = self.pci_cfg_cap;
        let bar = config.register_u8(cap + CAP_BAR);
        let offset = config.register_u32(cap + CAP_OFFSET) as u64;
        let len = config.register_u32(cap + CAP_LENGTH) as usize;
        match (bar, len) {
            (0, 1 | 2 | 4) if offset + len as u64 <= BAR0_SIZE => Some((offset, len)),
            _ => None,
        }
    }
}

impl PciDevice for VirtioPciDevice {
    fn config_read(&self, offset: usize, data: &mut [u8]) {
        if offset == self.pci_cfg_cap + CAP_PCI_CFG_DATA {
            data.fill(0);
            if let Some((bar_offset, len)) = self.pci_cfg_window() {
                let n = len.min(data.len());
                self.bar.read(bar_offset, &mut data[..n]);
            }
            return;
        }
        self.config.lock().read(offset, data)
    }

    fn config_write(&self, offset: usize, data: &[u8]) -> Vec<BarChange> {
        if offset == self.pci_cfg_cap + CAP_PCI_CFG_DATA {
            if let Some((bar_offset, len)) = self.pci_cfg_window() {
                let n = len.min(data.len());
                self.bar.write(bar_offset, &data[..n]);
            }
            return Vec::new();
        }
        self.config.lock().write(offset, data)
    }

    fn bar_device(&self, index: u8) -> Option<Arc<dyn BusDevice>> {
        match index {
            0 => Some(self.bar.clone()),
            _ => None,
        }
    }

    fn bar_changed(&self, change: &BarChange, dispatch: &dyn IoDispatch) {
        if change.index != 0 {
            return;
        }
        let notify = &self.transport.notify;
        if let Some(old) = change.old {
            for addr in self.notify_addresses(old.base) {
                if let Err(e) = dispatch.detach_notify(IoSpace::Memory, addr, notify) {
                    log::warn!("virtio-{:?}: detach notify {:#x}: {}", self.device_type(), addr, e);
                }
            }
        }
        *self.bar0.lock() = change.new.map(|r| r.base);
        if let Some(new) = change.new {
            for addr in self.notify_addresses(new.base) {
                match dispatch.attach_notify(IoSpace::Memory, addr, notify) {
                    Ok(true) => log::debug!("virtio-{:?}: notify {:#x} attached", self.device_type(), addr),
                    Ok(false) => (),
                    Err(e) => log::warn!("virtio-{:?}: attach notify {:#x}: {}", self.device_type(), addr, e),
                }
            }
        }
    }
}

impl Drop for VirtioPciDevice {
    fn drop(&mut self) {
        self.transport.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::ChainBuffers;

    struct Idle;

    impl VirtioBackend for Idle {
        fn device_type(&self) -> DeviceType {
            DeviceType::EntropySource
        }
        fn num_queues(&self) -> u16 {
            1
        }
        fn process(&mut self, _queue: u16, _chain: &ChainBuffers<'_>) -> Result<u32, QueueError> {
            Ok(0)
        }
    }

    #[test]
    fn failed_survives_a_concurrent_status_write() {
        let mem = Arc::new(GuestAddressSpace::new(0x1000).unwrap());
        let dev = VirtioPciDevice::new(Box::new(Idle), mem, 5, TransportConfig::default()).unwrap();
        let t = dev.transport.clone();
        for _ in 0..200 {
            t.write_status(0);
            t.write_status(Status::ACKNOWLEDGE.bits());
            let failer = {
                let t = t.clone();
                std::thread::spawn(move || t.fail(&QueueError::ProtocolViolation("test")))
            };
            t.write_status((Status::ACKNOWLEDGE | Status::DRIVER).bits());
            failer.join().unwrap();
            assert!(t.status().contains(Status::FAILED));
            assert!(t.status().contains(Status::DRIVER));
        }
    }
}
