//! Binary program image exchanged with the device.
//!
//! A program is one contiguous `C` command: byte-wide tables first, then a
//! little-endian `u32` block of tick counts and thresholds. Exit destinations
//! are written as the state count, one past the last valid state index.

use core::time::Duration;

use tracing::debug;
use winnow::binary::{self, le_u32};
use winnow::combinator::repeat;
use winnow::error::ContextError;
use winnow::prelude::*;

use crate::assembler::{FinalizedStateMachine, GlobalTimer, Target, Transition};
use crate::error::{CapacityError, ProtocolError, Result};
use crate::hardware::{ChannelMap, EventBand};
use crate::transport::decode_exact;

/// Command byte that introduces a program image.
pub const PROGRAM_COMMAND: u8 = b'C';

/// Largest state count whose Exit wire value still fits a byte.
pub const MAX_ENCODED_STATES: usize = 255;

/// Transition bands in the order their tables follow the output table.
const BANDED_TABLES: [EventBand; 4] = [
    EventBand::TimerStart,
    EventBand::TimerEnd,
    EventBand::Counter,
    EventBand::Condition,
];

/// Converts a duration to device ticks, rounding to the nearest tick.
pub fn duration_to_ticks(what: &'static str, duration: Duration, map: &ChannelMap) -> Result<u32> {
    let period_ns = u128::from(map.hardware().cycle_period) * 1_000;
    let ticks = (duration.as_nanos() + period_ns / 2) / period_ns;
    u32::try_from(ticks).map_err(|_| {
        CapacityError::DurationOutOfRange {
            what,
            seconds: duration.as_secs_f64(),
            frequency: map.tick_frequency(),
        }
        .into()
    })
}

/// Serializes a finalized machine into the device's program layout.
pub fn encode(machine: &FinalizedStateMachine, map: &ChannelMap) -> Result<Vec<u8>> {
    let states = machine.states();
    if states.len() > MAX_ENCODED_STATES.min(map.max_states()) {
        return Err(CapacityError::TooManyStates {
            declared: states.len(),
            max: MAX_ENCODED_STATES.min(map.max_states()),
        }
        .into());
    }
    let exit = u8::try_from(states.len()).unwrap_or(u8::MAX);
    let wire = |target: Target| match target {
        Target::State(index) => u8::try_from(index).unwrap_or(exit),
        Target::Exit => exit,
    };

    let mut bytes = vec![PROGRAM_COMMAND, exit];
    bytes.extend(states.iter().map(|state| wire(state.state_timer)));

    for state in states {
        push_transitions(&mut bytes, &state.name, "input", &state.input, 0, wire)?;
    }
    for state in states {
        bytes.push(table_len(&state.name, "output", state.outputs.len())?);
        for action in &state.outputs {
            bytes.extend([action.channel, action.value]);
        }
    }
    for band in BANDED_TABLES {
        let base = map.band_base(band);
        for state in states {
            let rules = state.table(band).unwrap_or_default();
            push_transitions(&mut bytes, &state.name, band_label(band), rules, base, wire)?;
        }
    }

    let timers = machine.global_timers();
    bytes.extend(
        timers
            .iter()
            .map(|timer| timer.channel.unwrap_or(GlobalTimer::NO_CHANNEL)),
    );
    bytes.extend(timers.iter().map(|timer| timer.on_value));
    bytes.extend(timers.iter().map(|timer| timer.off_value));
    bytes.extend(machine.global_counters().iter().map(|counter| counter.event));
    bytes.extend(machine.conditions().iter().map(|condition| condition.channel));
    bytes.extend(machine.conditions().iter().map(|condition| condition.value));

    let byte_block = bytes.len();
    for state in states {
        push_u32(&mut bytes, duration_to_ticks("state timer", state.timer, map)?);
    }
    for timer in timers {
        push_u32(&mut bytes, duration_to_ticks("global timer", timer.duration, map)?);
    }
    for timer in timers {
        push_u32(&mut bytes, duration_to_ticks("onset delay", timer.onset_delay, map)?);
    }
    for counter in machine.global_counters() {
        push_u32(&mut bytes, counter.threshold);
    }

    debug!(
        states = states.len(),
        table_bytes = byte_block,
        total_bytes = bytes.len(),
        "encoded program"
    );
    Ok(bytes)
}

fn push_transitions(
    bytes: &mut Vec<u8>,
    state: &str,
    table: &'static str,
    rules: &[Transition<Target>],
    base: u8,
    wire: impl Fn(Target) -> u8,
) -> Result<()> {
    bytes.push(table_len(state, table, rules.len())?);
    for rule in rules {
        // Band routing guarantees every code sits at or above its band base.
        bytes.push(rule.event.saturating_sub(base));
        bytes.push(wire(rule.destination));
    }
    Ok(())
}

fn table_len(state: &str, table: &'static str, count: usize) -> Result<u8> {
    u8::try_from(count).map_err(|_| {
        CapacityError::TableOverflow {
            state: state.to_string(),
            table,
            count,
        }
        .into()
    })
}

fn push_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_le_bytes());
}

const fn band_label(band: EventBand) -> &'static str {
    match band {
        EventBand::Input => "input",
        EventBand::TimerStart => "global timer start",
        EventBand::TimerEnd => "global timer end",
        EventBand::Counter => "global counter",
        EventBand::Condition => "condition",
        EventBand::Timeout => "state timer",
    }
}

/// Per-state view of a decoded program. Event codes are absolute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramState {
    /// Wire destination on `Tup`.
    pub timeout: u8,
    pub timer_ticks: u32,
    pub input: Vec<(u8, u8)>,
    pub outputs: Vec<(u8, u8)>,
    pub timer_start: Vec<(u8, u8)>,
    pub timer_end: Vec<(u8, u8)>,
    pub counter: Vec<(u8, u8)>,
    pub condition: Vec<(u8, u8)>,
}

impl ProgramState {
    /// Transition table for a band, `None` for the timeout band.
    #[must_use]
    pub fn table(&self, band: EventBand) -> Option<&[(u8, u8)]> {
        match band {
            EventBand::Input => Some(&self.input),
            EventBand::TimerStart => Some(&self.timer_start),
            EventBand::TimerEnd => Some(&self.timer_end),
            EventBand::Counter => Some(&self.counter),
            EventBand::Condition => Some(&self.condition),
            EventBand::Timeout => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramTimer {
    pub channel: u8,
    pub on_value: u8,
    pub off_value: u8,
    pub duration_ticks: u32,
    pub onset_ticks: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramCounter {
    pub event: u8,
    pub threshold: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramCondition {
    pub channel: u8,
    pub value: u8,
}

/// A program image parsed back into its tables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramImage {
    pub states: Vec<ProgramState>,
    pub timers: Vec<ProgramTimer>,
    pub counters: Vec<ProgramCounter>,
    pub conditions: Vec<ProgramCondition>,
}

impl ProgramImage {
    /// Parses a complete `C` command laid out for `map`.
    pub fn decode(bytes: &[u8], map: &ChannelMap) -> Result<Self> {
        match bytes.first() {
            Some(&PROGRAM_COMMAND) => {}
            Some(&found) => {
                return Err(ProtocolError::BadCommandTag {
                    expected: PROGRAM_COMMAND,
                    found,
                }
                .into());
            }
            None => {
                return Err(ProtocolError::Truncated {
                    what: "program image",
                    expected: 2,
                    found: 0,
                }
                .into());
            }
        }
        decode_exact("program image", &bytes[1..], |input: &mut &[u8]| {
            program(input, map)
        })
    }

    /// Resolves a wire destination; anything at or past the state count exits.
    #[must_use]
    pub fn target(&self, wire: u8) -> Target {
        let index = usize::from(wire);
        if index < self.states.len() {
            Target::State(index)
        } else {
            Target::Exit
        }
    }
}

fn byte(input: &mut &[u8]) -> core::result::Result<u8, ContextError> {
    binary::u8.parse_next(input)
}

fn word(input: &mut &[u8]) -> core::result::Result<u32, ContextError> {
    le_u32.parse_next(input)
}

fn pairs(input: &mut &[u8], base: u8) -> core::result::Result<Vec<(u8, u8)>, ContextError> {
    let count = usize::from(byte(input)?);
    let rules: Vec<(u8, u8)> = repeat(count, (byte, byte)).parse_next(input)?;
    Ok(rules
        .into_iter()
        .map(|(code, destination)| (code.saturating_add(base), destination))
        .collect())
}

fn program(input: &mut &[u8], map: &ChannelMap) -> core::result::Result<ProgramImage, ContextError> {
    let count = usize::from(byte(input)?);
    let timeouts: Vec<u8> = repeat(count, byte).parse_next(input)?;
    let mut states: Vec<ProgramState> = timeouts
        .into_iter()
        .map(|timeout| ProgramState {
            timeout,
            ..ProgramState::default()
        })
        .collect();

    for state in &mut states {
        state.input = pairs(input, 0)?;
    }
    for state in &mut states {
        state.outputs = pairs(input, 0)?;
    }
    for band in BANDED_TABLES {
        let base = map.band_base(band);
        for state in &mut states {
            let rules = pairs(input, base)?;
            match band {
                EventBand::TimerStart => state.timer_start = rules,
                EventBand::TimerEnd => state.timer_end = rules,
                EventBand::Counter => state.counter = rules,
                _ => state.condition = rules,
            }
        }
    }

    let timer_count = map.global_timer_count();
    let counter_count = map.global_counter_count();
    let condition_count = map.condition_count();
    let channels: Vec<u8> = repeat(timer_count, byte).parse_next(input)?;
    let on_values: Vec<u8> = repeat(timer_count, byte).parse_next(input)?;
    let off_values: Vec<u8> = repeat(timer_count, byte).parse_next(input)?;
    let counter_events: Vec<u8> = repeat(counter_count, byte).parse_next(input)?;
    let condition_channels: Vec<u8> = repeat(condition_count, byte).parse_next(input)?;
    let condition_values: Vec<u8> = repeat(condition_count, byte).parse_next(input)?;

    let state_ticks: Vec<u32> = repeat(count, word).parse_next(input)?;
    let durations: Vec<u32> = repeat(timer_count, word).parse_next(input)?;
    let onsets: Vec<u32> = repeat(timer_count, word).parse_next(input)?;
    let thresholds: Vec<u32> = repeat(counter_count, word).parse_next(input)?;

    for (state, ticks) in states.iter_mut().zip(state_ticks) {
        state.timer_ticks = ticks;
    }
    let timers = (0..timer_count)
        .map(|i| ProgramTimer {
            channel: channels[i],
            on_value: on_values[i],
            off_value: off_values[i],
            duration_ticks: durations[i],
            onset_ticks: onsets[i],
        })
        .collect();
    let counters = counter_events
        .into_iter()
        .zip(thresholds)
        .map(|(event, threshold)| ProgramCounter { event, threshold })
        .collect();
    let conditions = condition_channels
        .into_iter()
        .zip(condition_values)
        .map(|(channel, value)| ProgramCondition { channel, value })
        .collect();

    Ok(ProgramImage {
        states,
        timers,
        counters,
        conditions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::assembler::{GlobalTimerConfig, StateMachine};
    use crate::hardware::{HardwareDescription, InputKind, OutputKind};

    fn small_map() -> ChannelMap {
        ChannelMap::from_hardware(HardwareDescription {
            max_states: 16,
            cycle_period: 100,
            events_per_serial_channel: 0,
            global_timers: 0,
            global_counters: 0,
            conditions: 0,
            inputs: vec![
                InputKind::Port,
                InputKind::Port,
                InputKind::Port,
                InputKind::Port,
                InputKind::Uart,
            ],
            outputs: vec![OutputKind::Bnc, OutputKind::Pwm],
        })
        .unwrap()
    }

    #[test]
    fn small_program_matches_the_documented_layout() {
        let map = small_map();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("A", Duration::ZERO, &[("Tup", "B")], &[])
            .unwrap();
        sma.declare_state(
            "B",
            Duration::from_millis(500),
            &[("Port2In", "exit")],
            &[("BNC1", 1)],
        )
        .unwrap();
        let bytes = encode(&sma.finalize().unwrap(), &map).unwrap();

        assert_eq!(
            bytes,
            vec![
                b'C', 2, // tag, state count
                1, 1, // state timers: A -> B, B self-loop
                0, 1, 2, 2, // input tables, exit encoded as 2
                0, 1, 0, 1, // output tables
                0, 0, 0, 0, 0, 0, 0, 0, // timer start/end, counter, condition
                0, 0, 0, 0, 0x88, 0x13, 0, 0, // state timers in ticks
            ]
        );
    }

    #[test]
    fn banded_codes_are_rebased_and_restored() {
        let map = ChannelMap::from_hardware(HardwareDescription::state_machine_r2()).unwrap();
        let mut sma = StateMachine::new(&map);
        sma.set_global_timer(
            2,
            GlobalTimerConfig::new(Duration::from_secs(3))
                .onset_delay(Duration::from_millis(500))
                .channel("BNC1"),
        )
        .unwrap();
        sma.set_global_counter(1, "Port1In", 4).unwrap();
        sma.set_condition(3, "Port1", 1).unwrap();
        sma.declare_state(
            "Start",
            Duration::from_secs(1),
            &[
                ("GlobalTimer2_Start", "End"),
                ("GlobalTimer2_End", "exit"),
                ("GlobalCounter1_End", "End"),
                ("Condition3", "End"),
                ("SoftJump", "exit"),
            ],
            &[("GlobalTimerTrig", 2)],
        )
        .unwrap();
        sma.declare_state("End", Duration::ZERO, &[("Tup", "exit")], &[])
            .unwrap();
        let machine = sma.finalize().unwrap();
        let bytes = encode(&machine, &map).unwrap();

        let image = ProgramImage::decode(&bytes, &map).unwrap();
        let start = &image.states[0];
        assert_eq!(start.timeout, 0);
        assert_eq!(start.timer_ticks, 10_000);
        assert_eq!(start.timer_start, vec![(85, 1)]);
        assert_eq!(start.timer_end, vec![(90, 2)]);
        assert_eq!(start.counter, vec![(94, 1)]);
        assert_eq!(start.condition, vec![(101, 1), (107, 2)]);
        assert_eq!(image.states[1].timeout, 2);
        assert_eq!(image.target(2), Target::Exit);
        assert_eq!(
            image.timers[1],
            ProgramTimer {
                channel: 5,
                on_value: 1,
                off_value: 0,
                duration_ticks: 30_000,
                onset_ticks: 5_000,
            }
        );
        assert_eq!(image.timers[0].channel, 255);
        assert_eq!(
            image.counters[0],
            ProgramCounter {
                event: 68,
                threshold: 4
            }
        );
        assert_eq!(image.counters[1].event, 254);
        assert_eq!(
            image.conditions[2],
            ProgramCondition {
                channel: 8,
                value: 1
            }
        );

        // Relative codes on the wire.
        let timer_start_offset = 2 + 2 + 2 + 1 + 3;
        assert_eq!(bytes[timer_start_offset..timer_start_offset + 4], [1, 1, 1, 0]);
    }

    #[test]
    fn ticks_round_to_the_nearest_cycle() {
        let map = small_map();
        assert_eq!(
            duration_to_ticks("t", Duration::from_micros(149), &map).unwrap(),
            1
        );
        assert_eq!(
            duration_to_ticks("t", Duration::from_micros(150), &map).unwrap(),
            2
        );
        assert!(matches!(
            duration_to_ticks("state timer", Duration::from_secs(500_000), &map),
            Err(Error::Capacity(CapacityError::DurationOutOfRange { .. }))
        ));
    }

    #[test]
    fn decode_rejects_foreign_tags_and_trailing_bytes() {
        let map = small_map();
        assert!(matches!(
            ProgramImage::decode(b"R", &map),
            Err(Error::Protocol(ProtocolError::BadCommandTag { found: b'R', .. }))
        ));

        let mut sma = StateMachine::new(&map);
        sma.declare_state("A", Duration::ZERO, &[("Tup", "exit")], &[])
            .unwrap();
        let mut bytes = encode(&sma.finalize().unwrap(), &map).unwrap();
        bytes.push(0);
        assert!(matches!(
            ProgramImage::decode(&bytes, &map),
            Err(Error::Protocol(ProtocolError::TrailingBytes { count: 1, .. }))
        ));
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            ProgramImage::decode(&bytes, &map),
            Err(Error::Protocol(ProtocolError::Malformed { .. }))
        ));
    }
}
