//! In-memory state machine device.
//!
//! [`VirtualDevice`] implements `Read + Write` so it can stand in for a serial
//! port. Host commands are buffered until complete, answered immediately, and
//! a run request simulates the whole trial in device ticks before the reply is
//! queued. Reads never block: an empty reply queue reads as end of stream.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::time::Duration;

use bpod_core::assembler::Target;
use bpod_core::device::command;
use bpod_core::hardware::{EventBand, TERMINATION_CODE, VIRTUAL_OUTPUT_CHANNELS};
use bpod_core::interpreter::{EVENTS_OPCODE, SOFT_CODE_OPCODE};
use bpod_core::wire::{ProgramImage, duration_to_ticks};
use bpod_core::{ChannelMap, HardwareDescription, NamingError, Result};
use heapless::Vec as HeaplessVec;
use tracing::{debug, info, trace, warn};

/// Firmware version reported for `F`.
pub const FIRMWARE_VERSION: u32 = 22;

/// Largest number of event codes carried by one frame.
pub const MAX_FRAME_EVENTS: usize = 254;

type Frame = HeaplessVec<u8, MAX_FRAME_EVENTS>;

/// Bounds that force a runaway trial to terminate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RunLimits {
    pub max_events: usize,
    /// Simulated time after which the trial is ended.
    pub horizon: Duration,
}

impl RunLimits {
    pub const DEFAULT: Self = Self {
        max_events: 10_000,
        horizon: Duration::from_secs(600),
    };
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Scripted input event raised at a fixed time after trial start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stimulus {
    pub event: u8,
    pub at: Duration,
}

/// Host-visible side effects that do not belong to a trial.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceLog {
    pub overrides: Vec<(u8, u8)>,
    pub serial_writes: Vec<(u8, u8)>,
    pub serial_messages: HashMap<(u8, u8), Vec<u8>>,
    pub input_enables: Vec<bool>,
    pub sync: Option<(u8, u8)>,
    pub trials_run: usize,
    pub disconnected: bool,
}

/// A device that answers the host protocol from memory.
#[derive(Debug)]
pub struct VirtualDevice {
    map: ChannelMap,
    limits: RunLimits,
    pending: Vec<u8>,
    replies: VecDeque<u8>,
    program: Option<ProgramImage>,
    /// Acknowledgment owed on the next run after a program arrives.
    program_ack: Option<u8>,
    stimuli: Vec<Stimulus>,
    clock: u64,
    log: DeviceLog,
}

impl VirtualDevice {
    pub fn new(hardware: HardwareDescription) -> Result<Self> {
        let map = ChannelMap::from_hardware(hardware)?;
        Ok(Self {
            map,
            limits: RunLimits::DEFAULT,
            pending: Vec::new(),
            replies: VecDeque::new(),
            program: None,
            program_ack: None,
            stimuli: Vec::new(),
            clock: 0,
            log: DeviceLog::default(),
        })
    }

    /// A second-revision board.
    pub fn state_machine_r2() -> Result<Self> {
        Self::new(HardwareDescription::state_machine_r2())
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    #[must_use]
    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    #[must_use]
    pub fn program(&self) -> Option<&ProgramImage> {
        self.program.as_ref()
    }

    #[must_use]
    pub fn stimuli(&self) -> &[Stimulus] {
        &self.stimuli
    }

    /// Schedules `event` at `at` after the start of every following trial.
    pub fn add_stimulus(&mut self, event: &str, at: Duration) -> Result<()> {
        let code = self
            .map
            .event_code(event)
            .ok_or_else(|| NamingError::UnknownEventName {
                event: event.to_string(),
            })?;
        self.stimuli.push(Stimulus { event: code, at });
        self.stimuli.sort_by_key(|stimulus| stimulus.at);
        Ok(())
    }

    pub fn clear_stimuli(&mut self) {
        self.stimuli.clear();
    }

    /// Executes every complete command waiting in the input buffer.
    fn process(&mut self) {
        while let Some(&tag) = self.pending.first() {
            let Some(len) = self.command_len(tag) else {
                return;
            };
            let message: Vec<u8> = self.pending.drain(..len).collect();
            self.execute(&message);
        }
    }

    /// Length of the command starting with `tag`, once it is fully buffered.
    fn command_len(&self, tag: u8) -> Option<usize> {
        let buffered = &self.pending;
        let len = match tag {
            command::ENABLE_INPUTS => 1 + self.map.hardware().inputs.len(),
            command::SYNC_CONFIG | command::OVERRIDE_OUTPUT | command::SERIAL_WRITE => 3,
            command::LOAD_SERIAL_MESSAGE => 5 + usize::from(*buffered.get(4)?),
            command::PROGRAM => program_len(buffered, &self.map)?,
            _ => 1,
        };
        (buffered.len() >= len).then_some(len)
    }

    fn execute(&mut self, message: &[u8]) {
        let Some((&tag, body)) = message.split_first() else {
            return;
        };
        trace!(command = %char::from(tag), len = message.len(), "host command");
        match tag {
            command::HANDSHAKE => self.reply(&[command::HANDSHAKE_REPLY]),
            command::FIRMWARE_VERSION => self.reply(&FIRMWARE_VERSION.to_le_bytes()),
            command::HARDWARE_DESCRIPTION => match self.map.hardware().to_bytes() {
                Ok(bytes) => self.reply(&bytes),
                Err(error) => warn!(%error, "cannot describe hardware"),
            },
            command::ENABLE_INPUTS => {
                self.log.input_enables = body.iter().map(|byte| *byte != 0).collect();
                self.reply(&[1]);
            }
            command::SYNC_CONFIG => {
                self.log.sync = Some((body[0], body[1]));
                self.reply(&[1]);
            }
            command::PROGRAM => match ProgramImage::decode(message, &self.map) {
                Ok(image) => {
                    debug!(states = image.states.len(), "program loaded");
                    self.program = Some(image);
                    self.program_ack = Some(1);
                }
                Err(error) => {
                    warn!(%error, "rejected program");
                    self.program = None;
                    self.program_ack = Some(0);
                }
            },
            command::RUN => self.run(),
            command::OVERRIDE_OUTPUT => self.log.overrides.push((body[0], body[1])),
            command::SERIAL_WRITE => self.log.serial_writes.push((body[0], body[1])),
            command::LOAD_SERIAL_MESSAGE => {
                let (channel, id) = (body[0], body[2]);
                self.log
                    .serial_messages
                    .insert((channel, id), body[4..].to_vec());
                self.reply(&[1]);
            }
            command::RESET_SERIAL_MESSAGES => {
                self.log.serial_messages.clear();
                self.reply(&[1]);
            }
            command::DISCONNECT => {
                info!("host disconnected");
                self.log.disconnected = true;
            }
            other => warn!(byte = other, "ignoring unknown command byte"),
        }
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.replies.extend(bytes);
    }

    fn run(&mut self) {
        if let Some(ack) = self.program_ack.take() {
            self.reply(&[ack]);
        }
        let (frames, timestamps) = if let Some(image) = &self.program {
            Trial::new(image, &self.map, self.limits, &self.stimuli).simulate()
        } else {
            warn!("run requested without a program");
            (vec![termination_frame()], Vec::new())
        };

        let trial_start = u32::try_from(self.clock % (1 << 32)).unwrap_or_default();
        for frame in &frames {
            self.replies.extend(frame.iter());
        }
        self.reply(&trial_start.to_le_bytes());
        let count = u16::try_from(timestamps.len()).unwrap_or(u16::MAX);
        self.reply(&count.to_le_bytes());
        for ticks in timestamps.iter().take(usize::from(count)) {
            self.reply(&ticks.to_le_bytes());
        }

        let trial_end = timestamps.last().copied().unwrap_or_default();
        self.clock += u64::from(trial_end) + 1;
        self.log.trials_run += 1;
        info!(
            frames = frames.len(),
            events = timestamps.len(),
            "virtual trial complete"
        );
    }
}

impl Read for VirtualDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.replies.len());
        for (slot, byte) in buf.iter_mut().zip(self.replies.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for VirtualDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Byte length of the program at the front of `bytes`, if it is complete.
fn program_len(bytes: &[u8], map: &ChannelMap) -> Option<usize> {
    let states = usize::from(*bytes.get(1)?);
    let mut pos = 2 + states;
    for _ in 0..6 * states {
        let count = usize::from(*bytes.get(pos)?);
        pos += 1 + 2 * count;
    }
    let timers = map.global_timer_count();
    let counters = map.global_counter_count();
    let conditions = map.condition_count();
    pos += 3 * timers + counters + 2 * conditions;
    pos += 4 * (states + 2 * timers + counters);
    Some(pos)
}

fn termination_frame() -> Vec<u8> {
    vec![EVENTS_OPCODE, 1, TERMINATION_CODE]
}

/// One simulated trial over a decoded program.
struct Trial<'a> {
    image: &'a ProgramImage,
    map: &'a ChannelMap,
    limits: RunLimits,
    stimuli: Vec<(u32, u8)>,
    next_stimulus: usize,
    /// Input channel and level set by each input event code.
    input_edges: HashMap<u8, (u8, u8)>,
    input_levels: HashMap<u8, u8>,
    current: usize,
    state_deadline: Option<u32>,
    timer_starts: Vec<Option<u32>>,
    timer_ends: Vec<Option<u32>>,
    counts: Vec<u32>,
    /// Codes raised by state entry, delivered on the next cycle.
    immediate: Vec<u8>,
    frames: Vec<Vec<u8>>,
    timestamps: Vec<u32>,
}

impl<'a> Trial<'a> {
    fn new(
        image: &'a ProgramImage,
        map: &'a ChannelMap,
        limits: RunLimits,
        stimuli: &[Stimulus],
    ) -> Self {
        let stimuli = stimuli
            .iter()
            .filter_map(|stimulus| {
                duration_to_ticks("stimulus", stimulus.at, map)
                    .ok()
                    .map(|ticks| (ticks, stimulus.event))
            })
            .collect();

        let mut input_edges = HashMap::new();
        for (channel, name) in map.input_channels().iter().enumerate() {
            let Ok(channel) = u8::try_from(channel) else {
                break;
            };
            for (suffix, level) in [("In", 1), ("Out", 0)] {
                if let Some(code) = map.event_code(&format!("{name}{suffix}")) {
                    input_edges.insert(code, (channel, level));
                }
            }
        }

        Self {
            image,
            map,
            limits,
            stimuli,
            next_stimulus: 0,
            input_edges,
            input_levels: HashMap::new(),
            current: 0,
            state_deadline: None,
            timer_starts: vec![None; image.timers.len()],
            timer_ends: vec![None; image.timers.len()],
            counts: vec![0; image.counters.len()],
            immediate: Vec::new(),
            frames: Vec::new(),
            timestamps: Vec::new(),
        }
    }

    fn simulate(mut self) -> (Vec<Vec<u8>>, Vec<u32>) {
        let horizon = duration_to_ticks("horizon", self.limits.horizon, self.map).unwrap_or(u32::MAX);
        if self.image.states.is_empty() {
            self.frames.push(termination_frame());
            return (self.frames, self.timestamps);
        }
        self.enter_state(0, 0);

        loop {
            if self.timestamps.len() >= self.limits.max_events {
                warn!(events = self.timestamps.len(), "event limit reached, ending trial");
                break;
            }
            let Some(now) = self.next_tick() else {
                debug!("nothing pending, ending trial");
                break;
            };
            if now > horizon {
                warn!(horizon, "simulated horizon reached, ending trial");
                break;
            }

            let codes = self.collect_events(now);
            if codes.is_empty() {
                continue;
            }
            self.timestamps.extend(codes.iter().map(|_| now));
            let mut frame = vec![EVENTS_OPCODE, u8::try_from(codes.len()).unwrap_or(u8::MAX)];
            frame.extend(codes.iter());
            self.frames.push(frame);

            let target = codes.iter().find_map(|code| self.resolve(*code));
            match target {
                Some(Target::Exit) => break,
                Some(Target::State(next)) => self.enter_state(next, now),
                None => {}
            }
        }

        self.frames.push(termination_frame());
        (self.frames, self.timestamps)
    }

    /// Earliest pending tick, if anything is pending at all.
    fn next_tick(&self) -> Option<u32> {
        let last = self.timestamps.last().copied().unwrap_or_default();
        if !self.immediate.is_empty() {
            return Some(last);
        }
        [
            self.state_deadline,
            self.stimuli.get(self.next_stimulus).map(|(tick, _)| *tick),
        ]
        .into_iter()
        .chain(self.timer_starts.iter().copied())
        .chain(self.timer_ends.iter().copied())
        .flatten()
        .min()
        .map(|tick| tick.max(last))
    }

    /// Every event code that fires at `now`, in device order.
    fn collect_events(&mut self, now: u32) -> Frame {
        let mut codes = Frame::new();
        let mut raise = |code: u8| {
            if codes.push(code).is_err() {
                warn!(code, "frame full, dropping event");
            }
        };

        for code in self.immediate.drain(..) {
            raise(code);
        }
        while let Some(&(tick, code)) = self.stimuli.get(self.next_stimulus) {
            if tick > now {
                break;
            }
            self.next_stimulus += 1;
            if let Some(&(channel, level)) = self.input_edges.get(&code) {
                self.input_levels.insert(channel, level);
            }
            raise(code);
        }
        let offsets = self.map.offsets();
        for (index, slot) in self.timer_starts.iter_mut().enumerate() {
            if slot.is_some_and(|tick| tick <= now) {
                *slot = None;
                raise(offsets.timer_start + band_index(index));
            }
        }
        for (index, slot) in self.timer_ends.iter_mut().enumerate() {
            if slot.is_some_and(|tick| tick <= now) {
                *slot = None;
                raise(offsets.timer_end + band_index(index));
            }
        }
        if self.state_deadline.is_some_and(|tick| tick <= now) {
            self.state_deadline = None;
            raise(self.map.timeout_code());
        }

        let mut reached = Vec::new();
        for code in &codes {
            for (index, counter) in self.image.counters.iter().enumerate() {
                if counter.event != *code || self.counts[index] >= counter.threshold {
                    continue;
                }
                self.counts[index] += 1;
                if self.counts[index] == counter.threshold {
                    reached.push(offsets.counter + band_index(index));
                }
            }
        }
        for code in reached {
            if codes.push(code).is_err() {
                warn!(code, "frame full, dropping counter event");
            }
        }
        codes
    }

    fn resolve(&self, code: u8) -> Option<Target> {
        let state = self.image.states.get(self.current)?;
        match self.map.band(code)? {
            EventBand::Timeout => match self.image.target(state.timeout) {
                Target::State(index) if index == self.current => None,
                target => Some(target),
            },
            band => state
                .table(band)?
                .iter()
                .find(|(event, _)| *event == code)
                .map(|(_, destination)| self.image.target(*destination)),
        }
    }

    fn enter_state(&mut self, index: usize, now: u32) {
        trace!(state = index, tick = now, "entering state");
        self.current = index;
        let Some(state) = self.image.states.get(index) else {
            return;
        };

        self.state_deadline = match self.image.target(state.timeout) {
            Target::State(next) if next == index => None,
            _ => Some(now.saturating_add(state.timer_ticks)),
        };

        let virtual_base = self.map.output_channels().len() - VIRTUAL_OUTPUT_CHANNELS.len();
        let soft_code = self.map.output_channel_index("SoftCode");
        for &(channel, value) in &state.outputs {
            let offset = usize::from(channel).checked_sub(virtual_base);
            match offset {
                Some(0) => self.trigger_timer(value, now),
                Some(1) => self.cancel_timer(value),
                Some(2) => self.reset_counter(value),
                _ if Some(channel) == soft_code => {
                    self.frames.push(vec![SOFT_CODE_OPCODE, value]);
                }
                _ => {}
            }
        }

        self.check_conditions(index);
    }

    fn trigger_timer(&mut self, timer: u8, now: u32) {
        let Some(index) = usize::from(timer).checked_sub(1) else {
            return;
        };
        let Some(config) = self.image.timers.get(index) else {
            warn!(timer, "trigger for unknown global timer");
            return;
        };
        let start = now.saturating_add(config.onset_ticks);
        self.timer_starts[index] = Some(start);
        self.timer_ends[index] = Some(start.saturating_add(config.duration_ticks));
    }

    fn cancel_timer(&mut self, timer: u8) {
        let index = usize::from(timer).checked_sub(1);
        if let Some(index) = index.filter(|index| *index < self.timer_starts.len()) {
            self.timer_starts[index] = None;
            self.timer_ends[index] = None;
        }
    }

    fn reset_counter(&mut self, counter: u8) {
        if let Some(count) = usize::from(counter)
            .checked_sub(1)
            .and_then(|index| self.counts.get_mut(index))
        {
            *count = 0;
        }
    }

    /// Raises the first satisfied condition the state can transition on.
    fn check_conditions(&mut self, index: usize) {
        let Some(state) = self.image.states.get(index) else {
            return;
        };
        let base = self.map.offsets().condition;
        let satisfied = state.condition.iter().map(|(code, _)| *code).find(|code| {
            if self.map.is_jump(*code) {
                return false;
            }
            let Some(condition) = self.image.conditions.get(usize::from(code - base)) else {
                return false;
            };
            let level = self
                .input_levels
                .get(&condition.channel)
                .copied()
                .unwrap_or_default();
            level == condition.value
        });
        if let Some(code) = satisfied {
            self.immediate.push(code);
        }
    }
}

/// Position within a band as an event-code offset.
fn band_index(index: usize) -> u8 {
    u8::try_from(index).unwrap_or(u8::MAX)
}
