//! Hardware description reported by the device and the channel map derived from it.
//!
//! The channel map is built once per connection. It names every input event
//! and output channel the device exposes and records where each band of event
//! codes begins, so the assembler and the interpreter agree on which
//! transition table an event code belongs to.

use std::io::{Read, Write};

use crate::error::{CapacityError, ProtocolError, Result};
use crate::transport::TypedLink;

/// Synthesized output channels appended after the physical outputs.
pub const VIRTUAL_OUTPUT_CHANNELS: [&str; 3] =
    ["GlobalTimerTrig", "GlobalTimerCancel", "GlobalCounterReset"];

/// Event code reserved by the device to end the trial stream.
pub const TERMINATION_CODE: u8 = 255;

/// Number of ports enabled by the stock input policy.
const DEFAULT_ENABLED_PORTS: usize = 3;

/// Physical input channel categories.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InputKind {
    Uart,
    Usb,
    Port,
    Bnc,
    Wire,
    Other(u8),
}

impl InputKind {
    /// Decodes the type byte reported by the device.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            b'U' => Self::Uart,
            b'X' => Self::Usb,
            b'P' => Self::Port,
            b'B' => Self::Bnc,
            b'W' => Self::Wire,
            other => Self::Other(other),
        }
    }

    /// Type byte used on the wire.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Uart => b'U',
            Self::Usb => b'X',
            Self::Port => b'P',
            Self::Bnc => b'B',
            Self::Wire => b'W',
            Self::Other(other) => other,
        }
    }
}

/// Physical output channel categories.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputKind {
    Uart,
    Usb,
    Spi,
    Bnc,
    Wire,
    Pwm,
    Other(u8),
}

impl OutputKind {
    /// Decodes the type byte reported by the device.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            b'U' => Self::Uart,
            b'X' => Self::Usb,
            b'S' => Self::Spi,
            b'B' => Self::Bnc,
            b'W' => Self::Wire,
            b'P' => Self::Pwm,
            other => Self::Other(other),
        }
    }

    /// Type byte used on the wire.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Uart => b'U',
            Self::Usb => b'X',
            Self::Spi => b'S',
            Self::Bnc => b'B',
            Self::Wire => b'W',
            Self::Pwm => b'P',
            Self::Other(other) => other,
        }
    }
}

/// Fixed-layout capability report returned for the `H` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HardwareDescription {
    pub max_states: u16,
    /// Microseconds per device clock tick.
    pub cycle_period: u16,
    pub events_per_serial_channel: u8,
    pub global_timers: u8,
    pub global_counters: u8,
    pub conditions: u8,
    pub inputs: Vec<InputKind>,
    pub outputs: Vec<OutputKind>,
}

impl HardwareDescription {
    /// Capabilities of a second-revision state machine board.
    #[must_use]
    pub fn state_machine_r2() -> Self {
        Self {
            max_states: 256,
            cycle_period: 100,
            events_per_serial_channel: 15,
            global_timers: 5,
            global_counters: 5,
            conditions: 5,
            inputs: b"UUUXBBWWPPPPPPPP"
                .iter()
                .copied()
                .map(InputKind::from_byte)
                .collect(),
            outputs: b"UUUXSBBWWPPPPPPPP"
                .iter()
                .copied()
                .map(OutputKind::from_byte)
                .collect(),
        }
    }

    /// Reads the description that follows an `H` request.
    pub fn read_from<S: Read + Write>(link: &mut TypedLink<S>) -> Result<Self> {
        let max_states = link.read_u16()?;
        let cycle_period = link.read_u16()?;
        let events_per_serial_channel = link.read_u8()?;
        let global_timers = link.read_u8()?;
        let global_counters = link.read_u8()?;
        let conditions = link.read_u8()?;
        let input_count = link.read_u8()?;
        let inputs = link
            .read_bytes(usize::from(input_count))?
            .into_iter()
            .map(InputKind::from_byte)
            .collect();
        let output_count = link.read_u8()?;
        let outputs = link
            .read_bytes(usize::from(output_count))?
            .into_iter()
            .map(OutputKind::from_byte)
            .collect();

        Ok(Self {
            max_states,
            cycle_period,
            events_per_serial_channel,
            global_timers,
            global_counters,
            conditions,
            inputs,
            outputs,
        })
    }

    /// Serializes the description the way the device reports it.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let input_count = count_byte("input", self.inputs.len())?;
        let output_count = count_byte("output", self.outputs.len())?;

        let mut bytes = Vec::with_capacity(10 + self.inputs.len() + self.outputs.len());
        bytes.extend_from_slice(&self.max_states.to_le_bytes());
        bytes.extend_from_slice(&self.cycle_period.to_le_bytes());
        bytes.push(self.events_per_serial_channel);
        bytes.push(self.global_timers);
        bytes.push(self.global_counters);
        bytes.push(self.conditions);
        bytes.push(input_count);
        bytes.extend(self.inputs.iter().map(|kind| kind.as_byte()));
        bytes.push(output_count);
        bytes.extend(self.outputs.iter().map(|kind| kind.as_byte()));
        Ok(bytes)
    }
}

fn count_byte(kind: &'static str, len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| CapacityError::TooManyChannels { kind, len }.into())
}

/// Event-code bands in the order they appear in the event table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventBand {
    Input,
    TimerStart,
    TimerEnd,
    Counter,
    /// Condition events plus the serial/soft jump events that follow them.
    Condition,
    Timeout,
}

/// First event code of each band.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EventOffsets {
    pub timer_start: u8,
    pub timer_end: u8,
    pub counter: u8,
    pub condition: u8,
    pub jump: u8,
    pub timeout: u8,
}

/// Names and code boundaries derived from a [`HardwareDescription`].
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMap {
    hardware: HardwareDescription,
    input_channels: Vec<String>,
    event_names: Vec<String>,
    output_channels: Vec<String>,
    offsets: EventOffsets,
    uart_channels: usize,
}

impl ChannelMap {
    /// Derives the channel map for the reported hardware.
    pub fn from_hardware(hardware: HardwareDescription) -> Result<Self> {
        if hardware.cycle_period == 0 {
            return Err(ProtocolError::ZeroCyclePeriod.into());
        }

        let mut input_channels = Vec::new();
        let mut event_names = Vec::new();
        let mut counts = KindCounter::default();
        let per_serial = usize::from(hardware.events_per_serial_channel);

        for kind in &hardware.inputs {
            match kind {
                InputKind::Uart => {
                    let n = counts.next(b'U');
                    input_channels.push(format!("Serial{n}"));
                    event_names.extend((1..=per_serial).map(|j| format!("Serial{n}_{j}")));
                }
                InputKind::Usb => {
                    let n = counts.next(b'X');
                    input_channels.push(format!("USB{n}"));
                    event_names.extend((1..=per_serial).map(|j| format!("SoftCode{j}")));
                }
                InputKind::Port | InputKind::Bnc | InputKind::Wire => {
                    let prefix = match kind {
                        InputKind::Port => "Port",
                        InputKind::Bnc => "BNC",
                        _ => "Wire",
                    };
                    let n = counts.next(kind.as_byte());
                    let name = format!("{prefix}{n}");
                    event_names.push(format!("{name}In"));
                    event_names.push(format!("{name}Out"));
                    input_channels.push(name);
                }
                InputKind::Other(_) => {}
            }
        }
        let uart_channels = counts.get(b'U');

        let timer_start = event_names.len();
        event_names
            .extend((1..=hardware.global_timers).map(|n| format!("GlobalTimer{n}_Start")));
        let timer_end = event_names.len();
        event_names.extend((1..=hardware.global_timers).map(|n| format!("GlobalTimer{n}_End")));
        let counter = event_names.len();
        event_names
            .extend((1..=hardware.global_counters).map(|n| format!("GlobalCounter{n}_End")));
        let condition = event_names.len();
        event_names.extend((1..=hardware.conditions).map(|n| format!("Condition{n}")));
        let jump = event_names.len();
        event_names.extend((1..=uart_channels).map(|n| format!("Serial{n}Jump")));
        event_names.push("SoftJump".to_string());
        let timeout = event_names.len();
        event_names.push("Tup".to_string());

        let event_count = event_names.len();
        if event_count > usize::from(TERMINATION_CODE) {
            return Err(CapacityError::TooManyEvents {
                events: event_count,
            }
            .into());
        }
        // Every offset is below `event_count`, which was just bounded by 255.
        let code = |position: usize| u8::try_from(position).unwrap_or(TERMINATION_CODE);
        let offsets = EventOffsets {
            timer_start: code(timer_start),
            timer_end: code(timer_end),
            counter: code(counter),
            condition: code(condition),
            jump: code(jump),
            timeout: code(timeout),
        };

        let mut outputs = KindCounter::default();
        let mut output_channels = Vec::new();
        for kind in &hardware.outputs {
            let name = match kind {
                OutputKind::Uart => format!("Serial{}", outputs.next(b'U')),
                OutputKind::Usb => "SoftCode".to_string(),
                OutputKind::Spi => "ValveState".to_string(),
                OutputKind::Bnc => format!("BNC{}", outputs.next(b'B')),
                OutputKind::Wire => format!("Wire{}", outputs.next(b'W')),
                OutputKind::Pwm => format!("PWM{}", outputs.next(b'P')),
                OutputKind::Other(_) => continue,
            };
            output_channels.push(name);
        }
        output_channels.extend(VIRTUAL_OUTPUT_CHANNELS.iter().map(|name| (*name).to_string()));

        Ok(Self {
            hardware,
            input_channels,
            event_names,
            output_channels,
            offsets,
            uart_channels,
        })
    }

    /// Raw capabilities this map was derived from.
    #[must_use]
    pub fn hardware(&self) -> &HardwareDescription {
        &self.hardware
    }

    /// Band boundaries.
    #[must_use]
    pub const fn offsets(&self) -> EventOffsets {
        self.offsets
    }

    #[must_use]
    pub fn max_states(&self) -> usize {
        usize::from(self.hardware.max_states)
    }

    #[must_use]
    pub fn global_timer_count(&self) -> usize {
        usize::from(self.hardware.global_timers)
    }

    #[must_use]
    pub fn global_counter_count(&self) -> usize {
        usize::from(self.hardware.global_counters)
    }

    #[must_use]
    pub fn condition_count(&self) -> usize {
        usize::from(self.hardware.conditions)
    }

    #[must_use]
    pub fn uart_channel_count(&self) -> usize {
        self.uart_channels
    }

    /// Device clock ticks per second.
    #[must_use]
    pub fn tick_frequency(&self) -> f64 {
        1_000_000.0 / f64::from(self.hardware.cycle_period)
    }

    /// Converts a device tick count into seconds.
    #[must_use]
    pub fn ticks_to_seconds(&self, ticks: u32) -> f64 {
        f64::from(ticks) / self.tick_frequency()
    }

    /// Event code of `Tup`.
    #[must_use]
    pub const fn timeout_code(&self) -> u8 {
        self.offsets.timeout
    }

    /// Number of valid event codes (`Tup` is the last).
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_names.len()
    }

    #[must_use]
    pub fn event_names(&self) -> &[String] {
        &self.event_names
    }

    #[must_use]
    pub fn input_channels(&self) -> &[String] {
        &self.input_channels
    }

    #[must_use]
    pub fn output_channels(&self) -> &[String] {
        &self.output_channels
    }

    /// Looks up the code of a named event.
    #[must_use]
    pub fn event_code(&self, name: &str) -> Option<u8> {
        position_code(&self.event_names, name)
    }

    /// Looks up the name of an event code.
    #[must_use]
    pub fn event_name(&self, code: u8) -> Option<&str> {
        self.event_names.get(usize::from(code)).map(String::as_str)
    }

    #[must_use]
    pub fn input_channel_index(&self, name: &str) -> Option<u8> {
        position_code(&self.input_channels, name)
    }

    #[must_use]
    pub fn output_channel_index(&self, name: &str) -> Option<u8> {
        position_code(&self.output_channels, name)
    }

    /// Classifies an event code; `None` for codes the device never emits.
    #[must_use]
    pub fn band(&self, code: u8) -> Option<EventBand> {
        let offsets = &self.offsets;
        if usize::from(code) >= self.event_count() {
            None
        } else if code == offsets.timeout {
            Some(EventBand::Timeout)
        } else if code >= offsets.condition {
            Some(EventBand::Condition)
        } else if code >= offsets.counter {
            Some(EventBand::Counter)
        } else if code >= offsets.timer_end {
            Some(EventBand::TimerEnd)
        } else if code >= offsets.timer_start {
            Some(EventBand::TimerStart)
        } else {
            Some(EventBand::Input)
        }
    }

    /// First code of `band`; banded tables store codes relative to it on the wire.
    #[must_use]
    pub const fn band_base(&self, band: EventBand) -> u8 {
        match band {
            EventBand::Input => 0,
            EventBand::TimerStart => self.offsets.timer_start,
            EventBand::TimerEnd => self.offsets.timer_end,
            EventBand::Counter => self.offsets.counter,
            EventBand::Condition => self.offsets.condition,
            EventBand::Timeout => self.offsets.timeout,
        }
    }

    /// Returns `true` for `SerialNJump` and `SoftJump`.
    #[must_use]
    pub fn is_jump(&self, code: u8) -> bool {
        code >= self.offsets.jump && code < self.offsets.timeout
    }

    /// Stock enable mask: every BNC and wire input plus the first three ports.
    #[must_use]
    pub fn default_input_enables(&self) -> Vec<bool> {
        let mut ports_enabled = 0;
        self.hardware
            .inputs
            .iter()
            .map(|kind| match kind {
                InputKind::Bnc | InputKind::Wire => true,
                InputKind::Port if ports_enabled < DEFAULT_ENABLED_PORTS => {
                    ports_enabled += 1;
                    true
                }
                _ => false,
            })
            .collect()
    }
}

fn position_code(names: &[String], name: &str) -> Option<u8> {
    names
        .iter()
        .position(|candidate| candidate == name)
        .and_then(|index| u8::try_from(index).ok())
}

/// Per-kind 1-based numbering used when naming channels.
#[derive(Default)]
struct KindCounter {
    seen: Vec<(u8, usize)>,
}

impl KindCounter {
    fn next(&mut self, kind: u8) -> usize {
        if let Some(entry) = self.seen.iter_mut().find(|(seen, _)| *seen == kind) {
            entry.1 += 1;
            entry.1
        } else {
            self.seen.push((kind, 1));
            1
        }
    }

    fn get(&self, kind: u8) -> usize {
        self.seen
            .iter()
            .find(|(seen, _)| *seen == kind)
            .map_or(0, |(_, count)| *count)
    }
}
