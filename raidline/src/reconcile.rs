//! Device table reconciliation.
//!
//! A rescan fetches the physical and logical LUN lists and diffs them
//! against the [`DeviceTable`]. The diff is computed under the table lock
//! and produces [`DeviceEvent`]s; applying them to the host (creating and
//! removing units) happens later on the apply worker, outside that lock.
//!
//! Slot 0 always holds the controller itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use protocol_ciss::{CommandStatus, LunAddress, LunEntry, ReportLuns, RequestKind};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterId, Shared};
use crate::error::Error;

const APPLY_POLL: Duration = Duration::from_millis(100);

/// Slot reserved for the controller.
pub const CONTROLLER_SLOT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Controller,
    Physical,
    Logical,
}

impl DeviceKind {
    fn of(address: &LunAddress) -> Self {
        if address.is_controller() {
            DeviceKind::Controller
        } else if address.is_logical() {
            DeviceKind::Logical
        } else {
            DeviceKind::Physical
        }
    }
}

/// Properties compared to decide whether a device changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAttributes {
    pub device_type: u8,
    pub raid_level: Option<u8>,
    pub offline: bool,
}

impl From<&LunEntry> for DeviceAttributes {
    fn from(entry: &LunEntry) -> Self {
        DeviceAttributes {
            device_type: entry.device_type,
            raid_level: entry.raid_level,
            offline: entry.offline,
        }
    }
}

/// Host-side change an entry is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingChange {
    #[default]
    None,
    Add,
    Change,
    Delete,
}

/// Handle to a unit the host created for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceEntry {
    address: LunAddress,
    kind: DeviceKind,
    attributes: DeviceAttributes,
    unit: Option<UnitHandle>,
    pending: PendingChange,
}

/// Public view of one table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub slot: u16,
    pub address: LunAddress,
    pub kind: DeviceKind,
    pub attributes: DeviceAttributes,
    pub unit: Option<UnitHandle>,
    pub pending: PendingChange,
}

/// One host action produced by a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Add {
        slot: u16,
        address: LunAddress,
        attributes: DeviceAttributes,
    },
    Change {
        slot: u16,
        address: LunAddress,
        attributes: DeviceAttributes,
    },
    Delete {
        slot: u16,
        address: LunAddress,
    },
}

/// Device lists reported by the firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub physical: Vec<LunEntry>,
    pub logical: Vec<LunEntry>,
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub events: Vec<DeviceEvent>,
    /// Reported devices that did not fit in the table.
    pub dropped: Vec<LunAddress>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
    pub dropped: usize,
}

impl ReconcileReport {
    fn of(diff: &Diff) -> Self {
        let mut report = ReconcileReport {
            dropped: diff.dropped.len(),
            ..Default::default()
        };
        for event in &diff.events {
            match event {
                DeviceEvent::Add { .. } => report.added += 1,
                DeviceEvent::Change { .. } => report.changed += 1,
                DeviceEvent::Delete { .. } => report.deleted += 1,
            }
        }
        report
    }
}

/// Fixed-capacity table of known devices, indexed by slot.
pub struct DeviceTable {
    slots: Vec<Option<ResourceEntry>>,
}

impl DeviceTable {
    /// `capacity` includes the controller slot.
    pub fn new(capacity: u16) -> Self {
        let mut slots = vec![None; capacity.max(1) as usize];
        slots[CONTROLLER_SLOT as usize] = Some(ResourceEntry {
            address: LunAddress::CONTROLLER,
            kind: DeviceKind::Controller,
            attributes: DeviceAttributes::default(),
            unit: None,
            pending: PendingChange::None,
        });
        DeviceTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots, controller included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, slot: u16) -> Option<DeviceInfo> {
        let entry = self.slots.get(slot as usize)?.as_ref()?;
        Some(info(slot, entry))
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| info(slot as u16, e)))
            .collect()
    }

    /// Slot of the live entry for `address`. Entries waiting on a delete
    /// are not live.
    pub fn find(&self, address: &LunAddress) -> Option<u16> {
        self.slots
            .iter()
            .position(|entry| {
                entry
                    .as_ref()
                    .is_some_and(|e| e.address == *address && e.pending != PendingChange::Delete)
            })
            .map(|slot| slot as u16)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().skip(1).position(Option::is_none).map(|i| i + 1)
    }

    /// Diff the table against `snapshot` and mark every affected entry.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Diff {
        let mut diff = Diff::default();
        let reported: Vec<&LunEntry> = {
            let mut seen = HashSet::new();
            snapshot
                .physical
                .iter()
                .chain(snapshot.logical.iter())
                .filter(|e| !e.address.is_controller() && seen.insert(e.address))
                .collect()
        };
        let present: HashSet<LunAddress> = reported.iter().map(|e| e.address).collect();

        for (slot, entry) in self.slots.iter_mut().enumerate().skip(1) {
            let Some(e) = entry else { continue };
            if e.pending == PendingChange::Delete || present.contains(&e.address) {
                continue;
            }
            if e.unit.is_some() || e.pending != PendingChange::None {
                e.pending = PendingChange::Delete;
                diff.events.push(DeviceEvent::Delete {
                    slot: slot as u16,
                    address: e.address,
                });
            } else {
                // Never exposed to the host.
                *entry = None;
            }
        }

        for reported in reported {
            let attributes = DeviceAttributes::from(reported);
            if let Some(slot) = self.find(&reported.address) {
                let Some(e) = self.slots[slot as usize].as_mut() else {
                    continue;
                };
                if e.attributes != attributes {
                    e.attributes = attributes;
                    if e.pending == PendingChange::None {
                        e.pending = PendingChange::Change;
                    }
                    diff.events.push(DeviceEvent::Change {
                        slot,
                        address: e.address,
                        attributes,
                    });
                }
            } else if let Some(slot) = self.free_slot() {
                self.slots[slot] = Some(ResourceEntry {
                    address: reported.address,
                    kind: DeviceKind::of(&reported.address),
                    attributes,
                    unit: None,
                    pending: PendingChange::Add,
                });
                diff.events.push(DeviceEvent::Add {
                    slot: slot as u16,
                    address: reported.address,
                    attributes,
                });
            } else {
                warn!(address = %reported.address, "device table full, dropping device");
                diff.dropped.push(reported.address);
            }
        }
        diff
    }

    fn matching(&mut self, slot: u16, address: &LunAddress) -> Option<&mut ResourceEntry> {
        self.slots
            .get_mut(slot as usize)?
            .as_mut()
            .filter(|e| e.address == *address)
    }

    /// Record the unit created for an applied add. Returns false when the
    /// slot no longer holds `address`.
    pub fn bind(&mut self, slot: u16, address: &LunAddress, unit: Option<UnitHandle>) -> bool {
        let Some(e) = self.matching(slot, address) else {
            return false;
        };
        e.unit = unit;
        if e.pending == PendingChange::Add {
            e.pending = PendingChange::None;
        }
        true
    }

    /// Settle an applied change, returning the unit to notify.
    pub fn settle_change(&mut self, slot: u16, address: &LunAddress) -> Option<UnitHandle> {
        let e = self.matching(slot, address)?;
        if e.pending == PendingChange::Change {
            e.pending = PendingChange::None;
        }
        e.unit
    }

    /// Free a slot after its delete was applied, returning the unit to
    /// tear down.
    pub fn remove(&mut self, slot: u16, address: &LunAddress) -> Option<UnitHandle> {
        let entry = self.slots.get_mut(slot as usize)?;
        if entry
            .as_ref()
            .is_some_and(|e| e.address == *address && e.pending == PendingChange::Delete)
        {
            return entry.take().and_then(|e| e.unit);
        }
        None
    }
}

fn info(slot: u16, e: &ResourceEntry) -> DeviceInfo {
    DeviceInfo {
        slot,
        address: e.address,
        kind: e.kind,
        attributes: e.attributes,
        unit: e.unit,
        pending: e.pending,
    }
}

/// Host side of device exposure.
///
/// Called from the apply worker, never with the device table locked.
pub trait UnitHost: Send + Sync + 'static {
    /// Expose a new device. `None` declines it.
    fn attach(&self, adapter: AdapterId, device: &DeviceInfo) -> Option<UnitHandle>;

    fn changed(&self, unit: UnitHandle, device: &DeviceInfo);

    fn detach(&self, unit: UnitHandle);
}

// ── Rescan ───────────────────────────────────────────────────────────

pub(crate) fn rescan(shared: &Shared) -> Result<ReconcileReport, Error> {
    let physical = report_luns(shared, RequestKind::ReportPhysicalLuns)?;
    let logical = report_luns(shared, RequestKind::ReportLogicalLuns)?;
    let diff = shared
        .devices
        .lock()
        .reconcile(&Snapshot { physical, logical });

    let report = ReconcileReport::of(&diff);
    for event in &diff.events {
        match event {
            DeviceEvent::Add { .. } => shared.stats.device_added(),
            DeviceEvent::Change { .. } => shared.stats.device_changed(),
            DeviceEvent::Delete { .. } => shared.stats.device_removed(),
        }
    }
    for _ in &diff.dropped {
        shared.stats.device_dropped();
    }
    if !diff.events.is_empty() {
        shared
            .units
            .send(diff.events)
            .map_err(|_| Error::Disconnected)?;
    }
    info!(
        adapter = %shared.id,
        added = report.added,
        changed = report.changed,
        deleted = report.deleted,
        dropped = report.dropped,
        "device table reconciled"
    );
    Ok(report)
}

fn report_luns(shared: &Shared, kind: RequestKind) -> Result<Vec<LunEntry>, Error> {
    let (completion, data) =
        shared.issue_internal(kind, None, shared.config.reset.internal_timeout)?;
    if completion.status == CommandStatus::DataUnderrun {
        debug!(adapter = %shared.id, ?kind, residual = completion.residual, "short lun list");
    }
    Ok(ReportLuns::parse(&data)?)
}

// ── Apply worker ─────────────────────────────────────────────────────

pub(crate) fn run_apply(
    shared: Arc<Shared>,
    host: Arc<dyn UnitHost>,
    events: Receiver<Vec<DeviceEvent>>,
) {
    loop {
        match events.recv_timeout(APPLY_POLL) {
            Ok(batch) => {
                for event in batch {
                    apply(&shared, host.as_ref(), event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn apply(shared: &Shared, host: &dyn UnitHost, event: DeviceEvent) {
    match event {
        DeviceEvent::Add {
            slot,
            address,
            attributes,
        } => {
            let device = DeviceInfo {
                slot,
                address,
                kind: DeviceKind::of(&address),
                attributes,
                unit: None,
                pending: PendingChange::Add,
            };
            let unit = host.attach(shared.id, &device);
            let bound = shared.devices.lock().bind(slot, &address, unit);
            if !bound && let Some(unit) = unit {
                host.detach(unit);
            }
            debug!(adapter = %shared.id, slot, %address, ?unit, "device added");
        }
        DeviceEvent::Change {
            slot,
            address,
            attributes,
        } => {
            let unit = shared.devices.lock().settle_change(slot, &address);
            if let Some(unit) = unit {
                let device = DeviceInfo {
                    slot,
                    address,
                    kind: DeviceKind::of(&address),
                    attributes,
                    unit: Some(unit),
                    pending: PendingChange::None,
                };
                host.changed(unit, &device);
            }
            debug!(adapter = %shared.id, slot, %address, "device changed");
        }
        DeviceEvent::Delete { slot, address } => {
            let unit = shared.devices.lock().remove(slot, &address);
            if let Some(unit) = unit {
                host.detach(unit);
            }
            debug!(adapter = %shared.id, slot, %address, "device removed");
        }
    }
}
