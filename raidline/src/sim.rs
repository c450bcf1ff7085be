//! In-process adapter model.
//!
//! [`SimAdapter`] implements [`Hardware`] with enough firmware behaviour to
//! drive the engine end to end: reset handshakes, both transports, fetch
//! bucket checks, abort by tag, report-LUNs and event notification. Commands
//! are processed synchronously on the submit-port write; interrupts are
//! raised after the model's lock is released.
//!
//! Fault hooks (held completions, scripted statuses, lockups, failing
//! resets) let tests steer recovery paths deterministically.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use protocol_ciss::table::{SIGNATURE, event, transport};
use protocol_ciss::{
    CommandStatus, ErrorInfo, FIRMWARE_NOT_READY, FIRMWARE_READY, LunEntry, MAX_SG_ENTRIES,
    REPLY_EMPTY, Register, ReplyEntry, ReportLuns, RequestFrame, RequestKind, Tag, doorbell_in,
    doorbell_out, interrupt, parse_submit_word,
};

use crate::fetch::HEADER_BLOCKS;
use crate::hw::{Hardware, HostMemory, InterruptLine};

/// Static identity and capabilities of the simulated firmware.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// `major << 16 | minor`.
    pub firmware_version: u32,
    pub performant: bool,
    pub soft_reset: bool,
    pub max_queue_depth: u32,
    pub max_sg_entries: u32,
    pub reply_queues: u32,
    /// Scratch-pad reads that return not-ready after a reset.
    pub boot_polls: u32,
    pub acknowledge_alerts: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            firmware_version: (8 << 16) | 32,
            performant: true,
            soft_reset: false,
            max_queue_depth: 1024,
            max_sg_entries: MAX_SG_ENTRIES as u32,
            reply_queues: 4,
            boot_polls: 3,
            acknowledge_alerts: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Held {
    index: usize,
    tag: u32,
    queue: u8,
}

#[derive(Debug, Clone, Copy)]
struct Producer {
    head: usize,
    toggle: bool,
}

impl Producer {
    const START: Producer = Producer {
        head: 0,
        toggle: true,
    };
}

struct SimState {
    config: SimConfig,
    memory: Option<Arc<HostMemory>>,
    line: Option<Weak<dyn InterruptLine>>,

    doorbell_out: u32,
    int_status: u32,
    int_mask: u32,
    scratch: u32,
    boot_left: Option<u32>,
    heartbeat: u32,
    host_time: u64,

    transport_active: u32,
    producers: Vec<Producer>,
    fifo: VecDeque<u32>,

    holding: bool,
    held: Vec<Held>,
    scripted: VecDeque<CommandStatus>,
    stall_aborts: bool,
    locked_up: bool,
    failing_resets: u32,
    dead: bool,

    physical: Vec<LunEntry>,
    logical: Vec<LunEntry>,

    hard_resets: u32,
    soft_resets: u32,
    submissions: u64,
    last_bucket: Option<u8>,

    /// Vectors to raise once the lock is dropped.
    irqs: Vec<u16>,
}

impl SimState {
    fn alive(&self) -> bool {
        !self.dead && !self.locked_up && self.scratch == FIRMWARE_READY
    }

    fn raise(&mut self, vector: u16) {
        if self.int_status & !self.int_mask != 0 {
            self.irqs.push(vector);
        }
    }

    fn read(&mut self, reg: Register) -> u32 {
        match reg {
            Register::InterruptStatus => self.int_status,
            Register::InterruptMask => self.int_mask,
            Register::ReplyPort => self.fifo.pop_front().unwrap_or(REPLY_EMPTY),
            // Every doorbell is handled synchronously.
            Register::DoorbellIn => 0,
            Register::DoorbellOut => self.doorbell_out,
            Register::ScratchPad => self.read_scratch(),
            Register::Heartbeat => {
                if self.alive() {
                    self.heartbeat = self.heartbeat.wrapping_add(1);
                }
                self.heartbeat
            }
            Register::HostTimeLow => self.host_time as u32,
            Register::HostTimeHigh => (self.host_time >> 32) as u32,
            Register::SubmitPort | Register::InterruptClear => 0,
        }
    }

    fn read_scratch(&mut self) -> u32 {
        if let Some(left) = self.boot_left {
            if left == 0 {
                self.boot_left = None;
                self.scratch = FIRMWARE_READY;
                self.int_status |= interrupt::READY_TRANSITION;
                self.raise(0);
            } else {
                self.boot_left = Some(left - 1);
            }
        }
        self.scratch
    }

    fn write(&mut self, reg: Register, value: u32) {
        match reg {
            Register::DoorbellIn => self.doorbell(value),
            Register::InterruptMask => {
                self.int_mask = value;
                self.raise(0);
            }
            Register::InterruptClear => self.int_status &= !value,
            Register::SubmitPort => self.submit(value),
            Register::HostTimeLow => {
                self.host_time = (self.host_time & !0xFFFF_FFFF) | value as u64;
            }
            Register::HostTimeHigh => {
                self.host_time = (self.host_time & 0xFFFF_FFFF) | (value as u64) << 32;
            }
            _ => {}
        }
    }

    fn doorbell(&mut self, bits: u32) {
        if bits & doorbell_in::RESET_ALERT != 0 && self.config.acknowledge_alerts && !self.dead {
            self.doorbell_out |= doorbell_out::ALERT_ACK;
        }
        if bits & doorbell_in::HARD_RESET != 0 {
            self.hard_resets += 1;
            self.reset();
        } else if bits & doorbell_in::SOFT_RESET != 0 && self.config.soft_reset {
            self.soft_resets += 1;
            self.reset();
        }
        if bits & doorbell_in::CHANGE_CONFIG != 0 {
            self.apply_config();
        }
        if bits & doorbell_in::EVENT_ACK != 0
            && let Some(memory) = &self.memory
        {
            memory.table().event_notify = 0;
        }
    }

    fn reset(&mut self) {
        self.held.clear();
        self.fifo.clear();
        self.producers.fill(Producer::START);
        self.transport_active = 0;
        self.int_status = 0;
        self.int_mask = interrupt::ALL;
        self.doorbell_out = 0;
        self.locked_up = false;
        self.scratch = FIRMWARE_NOT_READY;
        self.boot_left = if self.dead {
            None
        } else if self.failing_resets > 0 {
            self.failing_resets -= 1;
            None
        } else {
            Some(self.config.boot_polls)
        };
        self.publish_identity();
    }

    fn publish_identity(&self) {
        let Some(memory) = &self.memory else { return };
        let mut table = memory.table();
        table.signature = SIGNATURE;
        table.firmware_version = self.config.firmware_version;
        let mut support = transport::SIMPLE;
        if self.config.performant {
            support |= transport::PERFORMANT;
        }
        if self.config.soft_reset {
            support |= transport::SOFT_RESET;
        }
        table.transport_support = support;
        table.max_queue_depth = self.config.max_queue_depth;
        table.max_sg_entries = self.config.max_sg_entries;
        table.reply_queue_count = self.config.reply_queues;
        table.transport_active = 0;
        table.event_notify = 0;
    }

    fn apply_config(&mut self) {
        let Some(memory) = &self.memory else { return };
        let mut table = memory.table();
        let requested = table.transport_request;
        let active = if requested & transport::PERFORMANT != 0 && self.config.performant {
            transport::PERFORMANT
        } else {
            transport::SIMPLE
        };
        table.transport_active = active;
        self.transport_active = active;
    }

    fn queue_count(&self) -> usize {
        let memory_queues = self.memory.as_ref().map_or(1, |m| m.queues());
        (self.config.reply_queues as usize).min(memory_queues).max(1)
    }

    fn submit(&mut self, word: u32) {
        self.submissions += 1;
        if !self.alive() {
            return;
        }
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let (address, bucket) = parse_submit_word(word);
        let Some(index) = memory.frame_index(address) else {
            return;
        };
        let Ok(frame) = memory.read_frame(index) else {
            return;
        };
        self.last_bucket = bucket;

        let status = match frame.kind {
            RequestKind::Scsi => {
                if let Some(b) = bucket {
                    let fetched = memory.table().fetch_buckets[b as usize & 7];
                    if (frame.sg_count as u16 + HEADER_BLOCKS) > fetched {
                        self.complete(
                            &memory,
                            index,
                            frame.tag,
                            frame.reply_queue,
                            CommandStatus::ProtocolError,
                        );
                        return;
                    }
                }
                if frame.sg_count as u32 > self.config.max_sg_entries {
                    CommandStatus::InvalidRequest
                } else if self.holding {
                    self.held.push(Held {
                        index,
                        tag: frame.tag,
                        queue: frame.reply_queue,
                    });
                    return;
                } else {
                    self.scripted.pop_front().unwrap_or(CommandStatus::Success)
                }
            }
            RequestKind::Abort => {
                if self.stall_aborts {
                    return;
                }
                let target = frame.abort_target & !Tag::FLAG_MASK;
                match self.held.iter().position(|h| h.tag == target) {
                    Some(pos) => {
                        let h = self.held.remove(pos);
                        self.complete(&memory, h.index, h.tag, h.queue, CommandStatus::Aborted);
                        CommandStatus::Success
                    }
                    None => CommandStatus::AbortFailed,
                }
            }
            RequestKind::NoOp | RequestKind::FlushCache => CommandStatus::Success,
            RequestKind::ReportPhysicalLuns | RequestKind::ReportLogicalLuns => {
                self.report_luns(&memory, &frame)
            }
        };
        self.complete(&memory, index, frame.tag, frame.reply_queue, status);
    }

    fn report_luns(&self, memory: &HostMemory, frame: &RequestFrame) -> CommandStatus {
        let Some(segment) = frame.segments().first() else {
            return CommandStatus::InvalidRequest;
        };
        let Some(mut buf) = memory.data_at(segment.address as u32) else {
            return CommandStatus::InvalidRequest;
        };
        let list = if frame.kind == RequestKind::ReportPhysicalLuns {
            &self.physical
        } else {
            &self.logical
        };
        if ReportLuns::encoded_len(list.len()) > segment.len as usize {
            return CommandStatus::DataOverrun;
        }
        ReportLuns::encode(list, &mut buf);
        CommandStatus::Success
    }

    fn complete(
        &mut self,
        memory: &HostMemory,
        index: usize,
        tag: u32,
        queue: u8,
        status: CommandStatus,
    ) {
        let error = !status.is_success();
        if error {
            memory.write_result(index, &ErrorInfo::new(status));
        }
        let tag = Tag::decode(tag);
        if self.transport_active & transport::PERFORMANT != 0 {
            let q = (queue as usize).min(self.queue_count() - 1);
            let ring = memory.ring(q);
            let producer = &mut self.producers[q];
            ring[producer.head].store(
                ReplyEntry::new(tag, error, producer.toggle).raw(),
                Ordering::Release,
            );
            producer.head += 1;
            if producer.head == ring.len() {
                producer.head = 0;
                producer.toggle = !producer.toggle;
            }
            self.int_status |= interrupt::REPLY_PENDING;
            self.raise(q as u16);
        } else {
            self.fifo.push_back(ReplyEntry::new(tag, error, false).raw());
            self.int_status |= interrupt::REPLY_PENDING;
            self.raise(0);
        }
    }
}

/// Simulated adapter.
pub struct SimAdapter {
    state: Mutex<SimState>,
}

impl SimAdapter {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let queues = config.reply_queues.max(1) as usize;
        Arc::new(SimAdapter {
            state: Mutex::new(SimState {
                config,
                memory: None,
                line: None,
                doorbell_out: 0,
                int_status: 0,
                int_mask: interrupt::ALL,
                scratch: FIRMWARE_READY,
                boot_left: None,
                heartbeat: 0,
                host_time: 0,
                transport_active: 0,
                producers: vec![Producer::START; queues],
                fifo: VecDeque::new(),
                holding: false,
                held: Vec::new(),
                scripted: VecDeque::new(),
                stall_aborts: false,
                locked_up: false,
                failing_resets: 0,
                dead: false,
                physical: Vec::new(),
                logical: Vec::new(),
                hard_resets: 0,
                soft_resets: 0,
                submissions: 0,
                last_bucket: None,
                irqs: Vec::new(),
            }),
        })
    }

    /// Run `f` under the model lock, then deliver any interrupts it raised.
    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let (result, irqs, line) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            let irqs = std::mem::take(&mut state.irqs);
            (result, irqs, state.line.clone())
        };
        if let Some(line) = line.and_then(|l| l.upgrade()) {
            for vector in irqs {
                line.raise(vector);
            }
        }
        result
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub fn set_devices(&self, physical: Vec<LunEntry>, logical: Vec<LunEntry>) {
        self.with(|s| {
            s.physical = physical;
            s.logical = logical;
        });
    }

    /// Flag a device change in the capability table's event word, if the
    /// host subscribed to it.
    pub fn notify_device_change(&self) {
        self.with(|s| {
            if let Some(memory) = &s.memory {
                let mut table = memory.table();
                table.event_notify |= event::RESCAN & table.event_notify_mask;
            }
        });
    }

    // ── Fault injection ──────────────────────────────────────────────

    /// Queue caller commands instead of completing them.
    pub fn hold_completions(&self, hold: bool) {
        self.with(|s| s.holding = hold);
    }

    /// Complete every held command with success.
    pub fn release_held(&self) -> usize {
        self.with(|s| {
            let Some(memory) = s.memory.clone() else {
                return 0;
            };
            let held = std::mem::take(&mut s.held);
            for h in &held {
                s.complete(&memory, h.index, h.tag, h.queue, CommandStatus::Success);
            }
            held.len()
        })
    }

    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Statuses returned, in order, by the next caller commands.
    pub fn script_status(&self, status: CommandStatus) {
        self.with(|s| s.scripted.push_back(status));
    }

    /// Drop abort requests on the floor.
    pub fn stall_aborts(&self, stall: bool) {
        self.with(|s| s.stall_aborts = stall);
    }

    /// Raise an error interrupt.
    pub fn inject_fatal(&self) {
        self.with(|s| {
            s.int_status |= interrupt::ERROR;
            s.raise(0);
        });
    }

    /// Freeze the firmware: heartbeat stops and submissions are lost until
    /// the next reset.
    pub fn lock_up(&self) {
        self.with(|s| s.locked_up = true);
    }

    /// The next `n` resets never come back to ready.
    pub fn fail_resets(&self, n: u32) {
        self.with(|s| s.failing_resets = n);
    }

    /// Fail permanently.
    pub fn kill(&self) {
        self.with(|s| s.dead = true);
    }

    pub fn acknowledge_alerts(&self, ack: bool) {
        self.with(|s| s.config.acknowledge_alerts = ack);
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn hard_resets(&self) -> u32 {
        self.state.lock().hard_resets
    }

    pub fn soft_resets(&self) -> u32 {
        self.state.lock().soft_resets
    }

    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn last_bucket(&self) -> Option<u8> {
        self.state.lock().last_bucket
    }

    pub fn host_time(&self) -> u64 {
        self.state.lock().host_time
    }

    pub fn transport_active(&self) -> u32 {
        self.state.lock().transport_active
    }
}

impl Hardware for SimAdapter {
    fn read(&self, reg: Register) -> u32 {
        self.with(|s| s.read(reg))
    }

    fn write(&self, reg: Register, value: u32) {
        self.with(|s| s.write(reg, value));
    }

    fn map_host_memory(&self, memory: Arc<HostMemory>) {
        self.with(|s| {
            s.producers = vec![Producer::START; s.config.reply_queues.max(1) as usize];
            s.memory = Some(memory);
            s.publish_identity();
        });
    }

    fn connect_interrupts(&self, line: Weak<dyn InterruptLine>) {
        self.with(|s| s.line = Some(line));
    }
}
