//! Host-side replay of the device's transition rules over the live event stream.
//!
//! The device executes the trial on its own and reports only event codes. The
//! interpreter walks the same finalized tables the device was programmed with
//! so the host knows which state each event moved the machine into, then
//! attaches the timestamps the device sends once the trial has ended.

use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::assembler::{FinalizedStateMachine, Target};
use crate::error::{ProtocolError, Result};
use crate::hardware::{ChannelMap, EventBand, TERMINATION_CODE};
use crate::transport::TypedLink;

/// Frame carrying a count followed by that many event codes.
pub const EVENTS_OPCODE: u8 = 1;
/// Frame carrying one soft code raised by the state machine.
pub const SOFT_CODE_OPCODE: u8 = 2;

/// Interpreter lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Running,
    /// The termination code arrived; only post-trial metadata remains.
    Terminated,
}

/// Everything observed during one trial, before it is folded into a record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawEventLog {
    /// Event codes in arrival order, termination excluded.
    pub events: Vec<u8>,
    /// Seconds since trial start, parallel to `events`.
    pub event_timestamps: Vec<f64>,
    /// Visited state indices; the first entry is always state 0.
    pub states: Vec<usize>,
    /// Log position of the event that entered each state after the first.
    pub state_entries: Vec<usize>,
    /// Entry time of every visited state followed by the trial end, so
    /// `state_timestamps.len() == states.len() + 1`.
    pub state_timestamps: Vec<f64>,
    pub soft_codes: Vec<u8>,
    /// Device clock at trial start, in seconds.
    pub trial_start_timestamp: f64,
}

impl RawEventLog {
    /// Time of the last timestamp the device reported.
    #[must_use]
    pub fn trial_end(&self) -> f64 {
        self.state_timestamps.last().copied().unwrap_or_default()
    }
}

/// Streaming interpreter for one trial.
#[derive(Debug)]
pub struct TrialInterpreter<'a> {
    machine: &'a FinalizedStateMachine,
    map: &'a ChannelMap,
    phase: Phase,
    current: usize,
    exited: bool,
    log: RawEventLog,
}

impl<'a> TrialInterpreter<'a> {
    #[must_use]
    pub fn new(machine: &'a FinalizedStateMachine, map: &'a ChannelMap) -> Self {
        Self {
            machine,
            map,
            phase: Phase::Running,
            current: 0,
            exited: false,
            log: RawEventLog {
                states: vec![0],
                ..RawEventLog::default()
            },
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// State the device is in according to the events seen so far.
    #[must_use]
    pub const fn current_state(&self) -> usize {
        self.current
    }

    /// Whether a transition to the exit has been resolved.
    #[must_use]
    pub const fn has_exited(&self) -> bool {
        self.exited
    }

    #[must_use]
    pub fn log(&self) -> &RawEventLog {
        &self.log
    }

    /// Applies the events of one opcode-1 frame.
    ///
    /// The device changes state at most once per cycle, so only the first
    /// event in a frame that matches a transition is resolved; later events
    /// are still logged.
    pub fn handle_events(&mut self, codes: &[u8]) -> Result<()> {
        let mut transitioned = false;
        for &code in codes {
            if self.phase == Phase::Terminated {
                break;
            }
            if code == TERMINATION_CODE {
                debug!(
                    events = self.log.events.len(),
                    states = self.log.states.len(),
                    "trial terminated"
                );
                self.phase = Phase::Terminated;
                break;
            }
            if usize::from(code) >= self.map.event_count() {
                return Err(ProtocolError::UnknownEventCode {
                    code,
                    event_count: self.map.event_count(),
                }
                .into());
            }

            self.log.events.push(code);
            if transitioned || self.exited {
                continue;
            }
            if let Some(target) = self.resolve(code) {
                transitioned = true;
                let position = self.log.events.len() - 1;
                match target {
                    Target::State(next) => {
                        trace!(event = code, from = self.current, to = next, "transition");
                        self.current = next;
                        self.log.states.push(next);
                        self.log.state_entries.push(position);
                    }
                    Target::Exit => {
                        trace!(event = code, from = self.current, "transition to exit");
                        self.exited = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Records a soft code; the current state is unaffected.
    pub fn handle_soft_code(&mut self, code: u8) {
        debug!(code, state = self.current, "soft code");
        self.log.soft_codes.push(code);
    }

    /// Finds the transition `code` triggers from the current state, if any.
    fn resolve(&self, code: u8) -> Option<Target> {
        let state = self.machine.state(self.current)?;
        match self.map.band(code)? {
            EventBand::Timeout => match state.state_timer {
                Target::State(index) if index == self.current => None,
                target => Some(target),
            },
            band => state
                .table(band)?
                .iter()
                .find(|rule| rule.event == code)
                .map(|rule| rule.destination),
        }
    }

    /// Reads and applies one opcode frame.
    pub fn read_frame<S: Read + Write>(&mut self, link: &mut TypedLink<S>) -> Result<Phase> {
        let mut header = [0; 2];
        link.read_into(&mut header)?;
        let [opcode, argument] = header;
        match opcode {
            EVENTS_OPCODE => {
                let codes = link.read_bytes(usize::from(argument))?;
                trace!(count = codes.len(), "event frame");
                self.handle_events(&codes)?;
            }
            SOFT_CODE_OPCODE => self.handle_soft_code(argument),
            opcode => return Err(ProtocolError::UnexpectedOpcode { opcode }.into()),
        }
        Ok(self.phase)
    }

    /// Attaches post-trial timing and returns the finished log.
    ///
    /// `timestamps` are device ticks since trial start, one per logged event.
    pub fn finish(mut self, trial_start_ticks: u32, timestamps: &[u32]) -> Result<RawEventLog> {
        let events = self.log.events.len();
        if timestamps.len() < events {
            return Err(ProtocolError::TimestampMismatch {
                events,
                timestamps: timestamps.len(),
            }
            .into());
        }

        let seconds: Vec<f64> = timestamps
            .iter()
            .map(|ticks| self.map.ticks_to_seconds(*ticks))
            .collect();
        let trial_end = seconds.last().copied().unwrap_or_default();

        let log = &mut self.log;
        log.trial_start_timestamp = self.map.ticks_to_seconds(trial_start_ticks);
        log.state_timestamps = std::iter::once(0.0)
            .chain(log.state_entries.iter().map(|position| seconds[*position]))
            .chain(std::iter::once(trial_end))
            .collect();
        log.event_timestamps = seconds;
        log.event_timestamps.truncate(events);
        Ok(self.log)
    }

    /// Reads frames until termination, then the trial start tick count and
    /// the timestamp array.
    pub fn run<S: Read + Write>(mut self, link: &mut TypedLink<S>) -> Result<RawEventLog> {
        while self.read_frame(link)? == Phase::Running {}
        let trial_start = link.read_u32()?;
        let count = link.read_u16()?;
        let timestamps = link.read_u32_array(usize::from(count))?;
        self.finish(trial_start, &timestamps)
    }
}
