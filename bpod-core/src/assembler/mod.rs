//! Symbolic state machine assembler.
//!
//! States, events and output channels are named; the assembler resolves every
//! name against a [`ChannelMap`], routes each state-change rule into the
//! transition table of its event band, and records targets that are named
//! before they are declared. [`StateMachine::finalize`] resolves those forward
//! references and yields the immutable [`FinalizedStateMachine`] that is
//! encoded, sent, and later replayed by the interpreter.

use core::time::Duration;
use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::error::{CapacityError, Error, NamingError, Result};
use crate::hardware::{ChannelMap, EventBand};

/// Target name that leaves the trial.
pub const EXIT_STATE: &str = "exit";

/// Attached-event value for a global counter that counts nothing.
pub const NO_COUNTER_EVENT: u8 = 254;

/// Meta output that opens valve `n` on the valve shift register.
pub const VALVE_META_OUTPUT: &str = "Valve";
/// Meta output that drives port `n`'s LED at full intensity.
pub const LED_META_OUTPUT: &str = "LED";

const VALVE_CHANNEL: &str = "ValveState";
const LED_INTENSITY: u8 = 255;
const VALVE_COUNT: u32 = 8;

/// Transition destination while the machine is still being assembled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    State(usize),
    Exit,
    /// Named before its state was declared.
    Unresolved(String),
}

/// Transition destination once every name is resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Target {
    State(usize),
    Exit,
}

/// One `(event code, destination)` rule scoped to a state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition<D> {
    pub event: u8,
    pub destination: D,
}

/// Output channel value applied when a state is entered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputAction {
    pub channel: u8,
    pub value: u8,
}

/// A declared state and its band-routed transition tables.
#[derive(Clone, Debug, PartialEq)]
pub struct StateDefinition<D> {
    pub name: String,
    pub timer: Duration,
    /// Where `Tup` leads; a self-loop unless the state names a `Tup` transition.
    pub state_timer: D,
    pub input: Vec<Transition<D>>,
    pub timer_start: Vec<Transition<D>>,
    pub timer_end: Vec<Transition<D>>,
    pub counter: Vec<Transition<D>>,
    pub condition: Vec<Transition<D>>,
    pub outputs: Vec<OutputAction>,
}

impl<D> StateDefinition<D> {
    /// Transition table for a band; `None` for the timeout band, which uses
    /// [`StateDefinition::state_timer`].
    #[must_use]
    pub fn table(&self, band: EventBand) -> Option<&[Transition<D>]> {
        match band {
            EventBand::Input => Some(&self.input),
            EventBand::TimerStart => Some(&self.timer_start),
            EventBand::TimerEnd => Some(&self.timer_end),
            EventBand::Counter => Some(&self.counter),
            EventBand::Condition => Some(&self.condition),
            EventBand::Timeout => None,
        }
    }

    fn table_mut(&mut self, band: EventBand) -> Option<&mut Vec<Transition<D>>> {
        match band {
            EventBand::Input => Some(&mut self.input),
            EventBand::TimerStart => Some(&mut self.timer_start),
            EventBand::TimerEnd => Some(&mut self.timer_end),
            EventBand::Counter => Some(&mut self.counter),
            EventBand::Condition => Some(&mut self.condition),
            EventBand::Timeout => None,
        }
    }

    fn map_destinations<T>(
        self,
        mut resolve: impl FnMut(D) -> Result<T>,
    ) -> Result<StateDefinition<T>> {
        let mut table = |rules: Vec<Transition<D>>| -> Result<Vec<Transition<T>>> {
            rules
                .into_iter()
                .map(|rule| {
                    Ok(Transition {
                        event: rule.event,
                        destination: resolve(rule.destination)?,
                    })
                })
                .collect()
        };
        let input = table(self.input)?;
        let timer_start = table(self.timer_start)?;
        let timer_end = table(self.timer_end)?;
        let counter = table(self.counter)?;
        let condition = table(self.condition)?;

        Ok(StateDefinition {
            name: self.name,
            timer: self.timer,
            state_timer: resolve(self.state_timer)?,
            input,
            timer_start,
            timer_end,
            counter,
            condition,
            outputs: self.outputs,
        })
    }
}

impl StateDefinition<Destination> {
    /// Whether any rule of this state still targets the undeclared `target`.
    fn references(&self, target: &str) -> bool {
        let unresolved = |destination: &Destination| {
            matches!(destination, Destination::Unresolved(name) if name == target)
        };
        unresolved(&self.state_timer)
            || [
                &self.input,
                &self.timer_start,
                &self.timer_end,
                &self.counter,
                &self.condition,
            ]
            .into_iter()
            .flatten()
            .any(|rule| unresolved(&rule.destination))
    }
}

/// Global timer record, indexed by timer number minus one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlobalTimer {
    pub duration: Duration,
    pub onset_delay: Duration,
    /// Output channel driven while the timer runs.
    pub channel: Option<u8>,
    pub on_value: u8,
    pub off_value: u8,
}

impl GlobalTimer {
    /// Wire value for a timer linked to no channel.
    pub const NO_CHANNEL: u8 = 255;

    pub const UNSET: Self = Self {
        duration: Duration::ZERO,
        onset_delay: Duration::ZERO,
        channel: None,
        on_value: 1,
        off_value: 0,
    };
}

impl Default for GlobalTimer {
    fn default() -> Self {
        Self::UNSET
    }
}

/// Symbolic global timer settings passed to [`StateMachine::set_global_timer`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlobalTimerConfig<'a> {
    pub duration: Duration,
    pub onset_delay: Duration,
    pub channel: Option<&'a str>,
    pub on_value: u8,
    pub off_value: u8,
}

impl<'a> GlobalTimerConfig<'a> {
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self {
            duration,
            onset_delay: Duration::ZERO,
            channel: None,
            on_value: 1,
            off_value: 0,
        }
    }

    #[must_use]
    pub const fn onset_delay(mut self, delay: Duration) -> Self {
        self.onset_delay = delay;
        self
    }

    /// Links the timer to an output channel by name.
    #[must_use]
    pub const fn channel(mut self, channel: &'a str) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub const fn on_value(mut self, value: u8) -> Self {
        self.on_value = value;
        self
    }

    #[must_use]
    pub const fn off_value(mut self, value: u8) -> Self {
        self.off_value = value;
        self
    }
}

/// Global counter record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlobalCounter {
    pub event: u8,
    pub threshold: u32,
}

impl Default for GlobalCounter {
    fn default() -> Self {
        Self {
            event: NO_COUNTER_EVENT,
            threshold: 0,
        }
    }
}

/// Condition record: an input channel and the level it must hold.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Condition {
    pub channel: u8,
    pub value: u8,
}

/// Incrementally assembled state machine bound to one device's channel map.
#[derive(Clone, Debug)]
pub struct StateMachine<'map> {
    map: &'map ChannelMap,
    states: Vec<StateDefinition<Destination>>,
    indices: HashMap<String, usize>,
    global_timers: Vec<GlobalTimer>,
    global_counters: Vec<GlobalCounter>,
    conditions: Vec<Condition>,
    /// Undeclared target name mapped to the first state that referenced it.
    forward_refs: IndexMap<String, String>,
}

impl<'map> StateMachine<'map> {
    #[must_use]
    pub fn new(map: &'map ChannelMap) -> Self {
        Self {
            map,
            states: Vec::new(),
            indices: HashMap::new(),
            global_timers: vec![GlobalTimer::UNSET; map.global_timer_count()],
            global_counters: vec![GlobalCounter::default(); map.global_counter_count()],
            conditions: vec![Condition::default(); map.condition_count()],
            forward_refs: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn channel_map(&self) -> &'map ChannelMap {
        self.map
    }

    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    #[must_use]
    pub fn states(&self) -> &[StateDefinition<Destination>] {
        &self.states
    }

    /// Target names referenced so far without a matching declaration.
    pub fn pending_references(&self) -> impl Iterator<Item = &str> {
        self.forward_refs
            .keys()
            .filter(|name| !self.indices.contains_key(*name))
            .map(String::as_str)
    }

    /// Registers a state, or replaces the definition of an existing one.
    ///
    /// `transitions` pairs event names with target state names (`exit` leaves
    /// the trial); `outputs` pairs output channel names with values. The
    /// returned index never changes once assigned.
    pub fn declare_state(
        &mut self,
        name: &str,
        timer: Duration,
        transitions: &[(&str, &str)],
        outputs: &[(&str, u32)],
    ) -> Result<usize> {
        let existing = self.state_index(name);
        let index = existing.unwrap_or(self.states.len());
        if existing.is_none() && index >= self.map.max_states() {
            return Err(CapacityError::TooManyStates {
                declared: index + 1,
                max: self.map.max_states(),
            }
            .into());
        }

        let mut state = StateDefinition {
            name: name.to_string(),
            timer,
            state_timer: Destination::State(index),
            input: Vec::new(),
            timer_start: Vec::new(),
            timer_end: Vec::new(),
            counter: Vec::new(),
            condition: Vec::new(),
            outputs: Vec::with_capacity(outputs.len()),
        };
        let mut new_refs = Vec::new();

        for &(event_name, target) in transitions {
            let event = self
                .map
                .event_code(event_name)
                .ok_or_else(|| NamingError::UnknownEvent {
                    state: name.to_string(),
                    event: event_name.to_string(),
                })?;
            let destination = if target == EXIT_STATE {
                Destination::Exit
            } else if target == name {
                Destination::State(index)
            } else if let Some(target_index) = self.state_index(target) {
                Destination::State(target_index)
            } else {
                new_refs.push(target);
                Destination::Unresolved(target.to_string())
            };

            match self.map.band(event) {
                Some(EventBand::Timeout) => state.state_timer = destination,
                Some(band) => {
                    if let Some(table) = state.table_mut(band) {
                        table.push(Transition { event, destination });
                    }
                }
                None => {
                    return Err(NamingError::UnknownEvent {
                        state: name.to_string(),
                        event: event_name.to_string(),
                    }
                    .into());
                }
            }
        }

        for &(channel, value) in outputs {
            state.outputs.push(self.resolve_output(name, channel, value)?);
        }

        for target in new_refs {
            self.forward_refs
                .entry(target.to_string())
                .or_insert_with(|| name.to_string());
        }

        if let Some(slot) = self.states.get_mut(index) {
            debug!(state = name, index, "redefining state");
            *slot = state;
            self.prune_forward_refs();
        } else {
            debug!(state = name, index, "declaring state");
            self.states.push(state);
            self.indices.insert(name.to_string(), index);
        }
        Ok(index)
    }

    /// Drops forward references no state holds any more and re-attributes
    /// the rest to the first state that still holds them.
    fn prune_forward_refs(&mut self) {
        let states = &self.states;
        self.forward_refs.retain(|target, referenced_by| {
            match states.iter().find(|state| state.references(target)) {
                Some(state) => {
                    referenced_by.clone_from(&state.name);
                    true
                }
                None => false,
            }
        });
    }

    fn resolve_output(&self, state: &str, channel: &str, value: u32) -> Result<OutputAction> {
        let (channel_name, value) = match channel {
            VALVE_META_OUTPUT => {
                if !(1..=VALVE_COUNT).contains(&value) {
                    return Err(CapacityError::IndexOutOfRange {
                        kind: "valve",
                        index: usize::try_from(value).unwrap_or(usize::MAX),
                        available: 8,
                    }
                    .into());
                }
                (VALVE_CHANNEL.to_string(), 1u32 << (value - 1))
            }
            LED_META_OUTPUT => (format!("PWM{value}"), u32::from(LED_INTENSITY)),
            other => (other.to_string(), value),
        };

        let index = self
            .map
            .output_channel_index(&channel_name)
            .ok_or_else(|| match channel {
                VALVE_META_OUTPUT => NamingError::MissingMetaChannel {
                    meta: VALVE_META_OUTPUT,
                    channel: channel_name.clone(),
                },
                LED_META_OUTPUT => NamingError::MissingMetaChannel {
                    meta: LED_META_OUTPUT,
                    channel: channel_name.clone(),
                },
                _ => NamingError::UnknownOutput {
                    state: state.to_string(),
                    channel: channel.to_string(),
                },
            })?;
        let value = u8::try_from(value).map_err(|_| CapacityError::ValueOutOfRange {
            channel: channel_name.clone(),
            value,
        })?;

        Ok(OutputAction {
            channel: index,
            value,
        })
    }

    /// Configures global timer `timer` (1-based).
    pub fn set_global_timer(&mut self, timer: usize, config: GlobalTimerConfig<'_>) -> Result<()> {
        let slot = one_based(&mut self.global_timers, "global timer", timer)?;
        let channel = match config.channel {
            Some(name) => Some(self.map.output_channel_index(name).ok_or_else(|| {
                NamingError::UnknownOutputChannel {
                    channel: name.to_string(),
                }
            })?),
            None => None,
        };
        *slot = GlobalTimer {
            duration: config.duration,
            onset_delay: config.onset_delay,
            channel,
            on_value: config.on_value,
            off_value: config.off_value,
        };
        Ok(())
    }

    /// Configures global counter `counter` (1-based) to count `event` up to `threshold`.
    pub fn set_global_counter(&mut self, counter: usize, event: &str, threshold: u32) -> Result<()> {
        let code = self
            .map
            .event_code(event)
            .ok_or_else(|| NamingError::UnknownEventName {
                event: event.to_string(),
            })?;
        let slot = one_based(&mut self.global_counters, "global counter", counter)?;
        *slot = GlobalCounter {
            event: code,
            threshold,
        };
        Ok(())
    }

    /// Configures condition `condition` (1-based): `channel` must read `value`.
    pub fn set_condition(&mut self, condition: usize, channel: &str, value: u8) -> Result<()> {
        let code = self.map.input_channel_index(channel).ok_or_else(|| {
            NamingError::UnknownInputChannel {
                channel: channel.to_string(),
            }
        })?;
        let slot = one_based(&mut self.conditions, "condition", condition)?;
        *slot = Condition {
            channel: code,
            value,
        };
        Ok(())
    }

    /// Resolves every forward reference and freezes the machine.
    pub fn finalize(self) -> Result<FinalizedStateMachine> {
        if self.states.is_empty() {
            return Err(CapacityError::NoStates.into());
        }
        if self.states.len() > self.map.max_states() {
            return Err(CapacityError::TooManyStates {
                declared: self.states.len(),
                max: self.map.max_states(),
            }
            .into());
        }
        if let Some((state, referenced_by)) = self
            .forward_refs
            .iter()
            .find(|(name, _)| !self.indices.contains_key(*name))
        {
            return Err(Error::UnresolvedReference {
                state: state.clone(),
                referenced_by: referenced_by.clone(),
            });
        }

        let indices = &self.indices;
        let resolve = |destination: Destination| -> Result<Target> {
            match destination {
                Destination::State(index) => Ok(Target::State(index)),
                Destination::Exit => Ok(Target::Exit),
                Destination::Unresolved(name) => indices
                    .get(&name)
                    .map(|index| Target::State(*index))
                    .ok_or(Error::UnresolvedReference {
                        referenced_by: String::new(),
                        state: name,
                    }),
            }
        };
        let states = self
            .states
            .into_iter()
            .map(|state| state.map_destinations(resolve))
            .collect::<Result<Vec<_>>>()?;

        info!(
            states = states.len(),
            forward_refs = self.forward_refs.len(),
            "state machine finalized"
        );

        Ok(FinalizedStateMachine {
            states,
            global_timers: self.global_timers,
            global_counters: self.global_counters,
            conditions: self.conditions,
        })
    }
}

fn one_based<'a, T>(slots: &'a mut [T], kind: &'static str, index: usize) -> Result<&'a mut T> {
    let available = slots.len();
    index
        .checked_sub(1)
        .and_then(|position| slots.get_mut(position))
        .ok_or_else(|| {
            CapacityError::IndexOutOfRange {
                kind,
                index,
                available,
            }
            .into()
        })
}

/// Fully resolved, read-only state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalizedStateMachine {
    states: Vec<StateDefinition<Target>>,
    global_timers: Vec<GlobalTimer>,
    global_counters: Vec<GlobalCounter>,
    conditions: Vec<Condition>,
}

impl FinalizedStateMachine {
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn states(&self) -> &[StateDefinition<Target>] {
        &self.states
    }

    #[must_use]
    pub fn state(&self, index: usize) -> Option<&StateDefinition<Target>> {
        self.states.get(index)
    }

    #[must_use]
    pub fn state_name(&self, index: usize) -> Option<&str> {
        self.states.get(index).map(|state| state.name.as_str())
    }

    #[must_use]
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|state| state.name == name)
    }

    #[must_use]
    pub fn global_timers(&self) -> &[GlobalTimer] {
        &self.global_timers
    }

    #[must_use]
    pub fn global_counters(&self) -> &[GlobalCounter] {
        &self.global_counters
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareDescription;

    fn r2() -> ChannelMap {
        ChannelMap::from_hardware(HardwareDescription::state_machine_r2()).unwrap()
    }

    const ZERO: Duration = Duration::ZERO;

    #[test]
    fn declaration_order_assigns_indices_and_redeclaration_reuses_them() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        assert_eq!(sma.declare_state("A", ZERO, &[], &[]).unwrap(), 0);
        assert_eq!(sma.declare_state("B", ZERO, &[], &[]).unwrap(), 1);
        assert_eq!(sma.declare_state("C", ZERO, &[], &[]).unwrap(), 2);
        assert_eq!(
            sma.declare_state("B", Duration::from_secs(2), &[("Tup", "C")], &[])
                .unwrap(),
            1
        );

        assert_eq!(sma.state_count(), 3);
        let b = &sma.states()[1];
        assert_eq!(b.timer, Duration::from_secs(2));
        assert_eq!(b.state_timer, Destination::State(2));
    }

    #[test]
    fn states_default_to_a_timer_self_loop() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("Wait", ZERO, &[("Port1In", "exit")], &[])
            .unwrap();
        let wait = &sma.states()[0];
        assert_eq!(wait.state_timer, Destination::State(0));
        assert_eq!(
            wait.input,
            vec![Transition {
                event: 68,
                destination: Destination::Exit
            }]
        );
    }

    #[test]
    fn forward_references_resolve_everywhere_on_finalize() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state(
            "Start",
            ZERO,
            &[
                ("Tup", "D"),
                ("Port1In", "D"),
                ("GlobalTimer1_Start", "D"),
                ("GlobalTimer1_End", "D"),
                ("GlobalCounter1_End", "D"),
                ("Condition1", "D"),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(sma.pending_references().collect::<Vec<_>>(), vec!["D"]);
        sma.declare_state("D", ZERO, &[("Tup", "exit")], &[]).unwrap();
        assert_eq!(sma.pending_references().count(), 0);

        let machine = sma.finalize().unwrap();
        let start = machine.state(0).unwrap();
        let d = Target::State(1);
        assert_eq!(start.state_timer, d);
        for table in [
            &start.input,
            &start.timer_start,
            &start.timer_end,
            &start.counter,
            &start.condition,
        ] {
            assert_eq!(table.len(), 1);
            assert_eq!(table[0].destination, d);
        }
        assert_eq!(machine.state(1).unwrap().state_timer, Target::Exit);
    }

    #[test]
    fn undeclared_reference_fails_finalize_with_its_name() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("Start", ZERO, &[("Tup", "Nowhere")], &[])
            .unwrap();
        match sma.finalize() {
            Err(Error::UnresolvedReference {
                state,
                referenced_by,
            }) => {
                assert_eq!(state, "Nowhere");
                assert_eq!(referenced_by, "Start");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn redeclaring_a_state_forgets_the_references_it_dropped() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("A", ZERO, &[("Tup", "Ghost"), ("Port1In", "Later")], &[])
            .unwrap();
        sma.declare_state("B", ZERO, &[("Tup", "Later")], &[]).unwrap();
        sma.declare_state("A", ZERO, &[("Tup", "exit")], &[]).unwrap();
        assert_eq!(sma.pending_references().collect::<Vec<_>>(), vec!["Later"]);

        match sma.clone().finalize() {
            Err(Error::UnresolvedReference {
                state,
                referenced_by,
            }) => {
                assert_eq!(state, "Later");
                assert_eq!(referenced_by, "B");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        sma.declare_state("Later", ZERO, &[("Tup", "exit")], &[])
            .unwrap();
        let machine = sma.finalize().unwrap();
        assert_eq!(machine.state(0).unwrap().state_timer, Target::Exit);
        assert_eq!(machine.state(1).unwrap().state_timer, Target::State(2));
    }

    #[test]
    fn unknown_event_names_identify_the_state() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        let error = sma
            .declare_state("Broken", ZERO, &[("Port99In", "exit")], &[])
            .unwrap_err();
        assert!(matches!(
            error,
            Error::Naming(NamingError::UnknownEvent { ref state, ref event })
                if state == "Broken" && event == "Port99In"
        ));
        assert_eq!(sma.state_count(), 0);
    }

    #[test]
    fn each_band_lands_in_its_own_table() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state(
            "S",
            ZERO,
            &[
                ("BNC1In", "exit"),
                ("GlobalTimer2_Start", "exit"),
                ("GlobalTimer3_End", "exit"),
                ("GlobalCounter4_End", "exit"),
                ("Condition5", "exit"),
                ("SoftJump", "exit"),
            ],
            &[],
        )
        .unwrap();
        let s = &sma.states()[0];
        let codes = |rules: &[Transition<Destination>]| -> Vec<u8> {
            rules.iter().map(|rule| rule.event).collect()
        };
        assert_eq!(codes(&s.input), vec![60]);
        assert_eq!(codes(&s.timer_start), vec![85]);
        assert_eq!(codes(&s.timer_end), vec![91]);
        assert_eq!(codes(&s.counter), vec![97]);
        assert_eq!(codes(&s.condition), vec![103, 107]);
        assert_eq!(s.state_timer, Destination::State(0));
    }

    #[test]
    fn meta_outputs_expand_to_physical_channels() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.declare_state(
            "Reward",
            ZERO,
            &[],
            &[("Valve", 3), ("LED", 2), ("BNC1", 1)],
        )
        .unwrap();
        let outputs = &sma.states()[0].outputs;
        assert_eq!(
            outputs,
            &vec![
                OutputAction {
                    channel: 4,
                    value: 4
                },
                OutputAction {
                    channel: 10,
                    value: 255
                },
                OutputAction {
                    channel: 5,
                    value: 1
                },
            ]
        );
    }

    #[test]
    fn unknown_outputs_are_naming_errors() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        let error = sma
            .declare_state("S", ZERO, &[], &[("Laser", 1)])
            .unwrap_err();
        assert!(matches!(
            error,
            Error::Naming(NamingError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn auxiliary_records_use_one_based_indices() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        sma.set_global_timer(
            1,
            GlobalTimerConfig::new(Duration::from_secs(3))
                .onset_delay(Duration::from_millis(1_500))
                .channel("BNC2"),
        )
        .unwrap();
        sma.set_global_counter(2, "Port1In", 5).unwrap();
        sma.set_condition(1, "Port2", 1).unwrap();
        sma.declare_state("S", ZERO, &[("Tup", "exit")], &[]).unwrap();

        let machine = sma.finalize().unwrap();
        assert_eq!(machine.global_timers().len(), 5);
        assert_eq!(machine.global_timers()[0].channel, Some(6));
        assert_eq!(
            machine.global_timers()[0].onset_delay,
            Duration::from_millis(1_500)
        );
        assert_eq!(machine.global_counters()[0].event, NO_COUNTER_EVENT);
        assert_eq!(
            machine.global_counters()[1],
            GlobalCounter {
                event: 68,
                threshold: 5
            }
        );
        assert_eq!(
            machine.conditions()[0],
            Condition {
                channel: 9,
                value: 1
            }
        );
    }

    #[test]
    fn auxiliary_indices_outside_the_device_count_are_capacity_errors() {
        let map = r2();
        let mut sma = StateMachine::new(&map);
        for index in [0, 6] {
            let errors = [
                sma.set_global_timer(index, GlobalTimerConfig::new(ZERO))
                    .unwrap_err(),
                sma.set_global_counter(index, "Port1In", 3).unwrap_err(),
                sma.set_condition(index, "Port1", 1).unwrap_err(),
            ];
            let kinds: Vec<&str> = errors
                .iter()
                .map(|error| match error {
                    Error::Capacity(CapacityError::IndexOutOfRange {
                        kind,
                        index: found,
                        available: 5,
                    }) if *found == index => *kind,
                    other => panic!("unexpected error: {other:?}"),
                })
                .collect();
            assert_eq!(kinds, ["global timer", "global counter", "condition"]);
        }
        assert!(sma.global_counters.iter().all(|counter| counter.event == NO_COUNTER_EVENT));
        assert!(sma.conditions.iter().all(|condition| *condition == Condition::default()));
    }

    #[test]
    fn declaring_past_the_device_maximum_fails() {
        let mut hardware = HardwareDescription::state_machine_r2();
        hardware.max_states = 2;
        let map = ChannelMap::from_hardware(hardware).unwrap();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("A", ZERO, &[], &[]).unwrap();
        sma.declare_state("B", ZERO, &[], &[]).unwrap();
        sma.declare_state("A", ZERO, &[], &[]).unwrap();
        let error = sma.declare_state("C", ZERO, &[], &[]).unwrap_err();
        assert!(matches!(
            error,
            Error::Capacity(CapacityError::TooManyStates {
                declared: 3,
                max: 2
            })
        ));
    }
}
