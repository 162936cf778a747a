//! Trial records and the caller-owned session that accumulates them.

use indexmap::IndexMap;
use tracing::info;

use crate::assembler::FinalizedStateMachine;
use crate::error::{ProtocolError, Result};
use crate::hardware::ChannelMap;
use crate::interpreter::RawEventLog;

/// Time spent in one visit to a state, in seconds since trial start.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    /// Placeholder for states that were never entered.
    pub const NOT_VISITED: Self = Self {
        start: f64::NAN,
        end: f64::NAN,
    };

    #[must_use]
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn is_visited(&self) -> bool {
        !(self.start.is_nan() && self.end.is_nan())
    }

    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Per-state intervals and per-event timestamps of one completed trial.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrialRecord {
    /// Visited states in first-visit order, then unvisited states in
    /// declaration order.
    pub states: IndexMap<String, Vec<Interval>>,
    /// Events in order of first occurrence.
    pub events: IndexMap<String, Vec<f64>>,
    pub trial_start_timestamp: f64,
}

impl TrialRecord {
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&[Interval]> {
        self.states.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn event(&self, name: &str) -> Option<&[f64]> {
        self.events.get(name).map(Vec::as_slice)
    }

    /// Names of states entered at least once.
    pub fn visited_states(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .filter(|(_, intervals)| intervals.iter().any(Interval::is_visited))
            .map(|(name, _)| name.as_str())
    }

    /// Every visited interval sorted by start time.
    #[must_use]
    pub fn timeline(&self) -> Vec<(&str, Interval)> {
        let mut timeline: Vec<(&str, Interval)> = self
            .states
            .iter()
            .flat_map(|(name, intervals)| {
                intervals
                    .iter()
                    .filter(|interval| interval.is_visited())
                    .map(move |interval| (name.as_str(), *interval))
            })
            .collect();
        timeline.sort_by(|a, b| a.1.start.total_cmp(&b.1.start));
        timeline
    }
}

/// Folds a raw log into a [`TrialRecord`] keyed by state and event names.
pub fn materialize(
    log: &RawEventLog,
    machine: &FinalizedStateMachine,
    map: &ChannelMap,
) -> Result<TrialRecord> {
    if log.state_timestamps.len() != log.states.len() + 1 {
        return Err(ProtocolError::TimestampMismatch {
            events: log.states.len() + 1,
            timestamps: log.state_timestamps.len(),
        }
        .into());
    }

    let mut states: IndexMap<String, Vec<Interval>> = IndexMap::new();
    for (position, &index) in log.states.iter().enumerate() {
        let name = machine
            .state_name(index)
            .ok_or(ProtocolError::Malformed { what: "state log" })?;
        let interval = Interval::new(
            log.state_timestamps[position],
            log.state_timestamps[position + 1],
        );
        states.entry(name.to_string()).or_default().push(interval);
    }
    for state in machine.states() {
        states
            .entry(state.name.clone())
            .or_insert_with(|| vec![Interval::NOT_VISITED]);
    }

    let mut events: IndexMap<String, Vec<f64>> = IndexMap::new();
    for (&code, &timestamp) in log.events.iter().zip(&log.event_timestamps) {
        let name = map.event_name(code).ok_or(ProtocolError::UnknownEventCode {
            code,
            event_count: map.event_count(),
        })?;
        events.entry(name.to_string()).or_default().push(timestamp);
    }

    Ok(TrialRecord {
        states,
        events,
        trial_start_timestamp: log.trial_start_timestamp,
    })
}

/// Trials collected over one session, owned by the caller.
#[derive(Clone, Debug, Default)]
pub struct SessionData {
    trials: Vec<TrialRecord>,
    raw_events: Vec<RawEventLog>,
}

impl SessionData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Materializes `log` and appends the record; returns it for inspection.
    pub fn add_trial(
        &mut self,
        log: RawEventLog,
        machine: &FinalizedStateMachine,
        map: &ChannelMap,
    ) -> Result<&TrialRecord> {
        let record = materialize(&log, machine, map)?;
        self.raw_events.push(log);
        self.trials.push(record);
        info!(trial = self.trials.len(), "trial added to session");
        Ok(&self.trials[self.trials.len() - 1])
    }

    #[must_use]
    pub fn n_trials(&self) -> usize {
        self.trials.len()
    }

    #[must_use]
    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    #[must_use]
    pub fn raw_events(&self) -> &[RawEventLog] {
        &self.raw_events
    }

    #[must_use]
    pub fn trial_start_timestamps(&self) -> Vec<f64> {
        self.trials
            .iter()
            .map(|trial| trial.trial_start_timestamp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::*;
    use crate::assembler::StateMachine;
    use crate::hardware::HardwareDescription;
    use crate::interpreter::TrialInterpreter;

    fn r2() -> ChannelMap {
        ChannelMap::from_hardware(HardwareDescription::state_machine_r2()).unwrap()
    }

    fn loop_machine(map: &ChannelMap) -> FinalizedStateMachine {
        let mut sma = StateMachine::new(map);
        sma.declare_state("Wait", Duration::from_secs(1), &[("Port1In", "On")], &[])
            .unwrap();
        sma.declare_state("On", Duration::from_millis(100), &[("Tup", "Off")], &[])
            .unwrap();
        sma.declare_state(
            "Off",
            Duration::from_millis(100),
            &[("Tup", "Wait"), ("Port2In", "exit")],
            &[],
        )
        .unwrap();
        sma.declare_state("Never", Duration::ZERO, &[("Tup", "exit")], &[])
            .unwrap();
        sma.finalize().unwrap()
    }

    fn run(map: &ChannelMap, machine: &FinalizedStateMachine) -> RawEventLog {
        let port1_in = map.event_code("Port1In").unwrap();
        let port2_in = map.event_code("Port2In").unwrap();
        let tup = map.timeout_code();
        let mut interpreter = TrialInterpreter::new(machine, map);
        for frame in [
            [port1_in].as_slice(),
            &[tup],
            &[tup],
            &[port1_in],
            &[tup],
            &[port2_in],
            &[255],
        ] {
            interpreter.handle_events(frame).unwrap();
        }
        interpreter
            .finish(1_000, &[2_000, 3_000, 4_000, 5_000, 6_000, 7_500])
            .unwrap()
    }

    #[test]
    fn visited_intervals_tile_the_trial() {
        let map = r2();
        let machine = loop_machine(&map);
        let record = materialize(&run(&map, &machine), &machine, &map).unwrap();

        let timeline = record.timeline();
        assert_eq!(timeline.first().unwrap().1.start, 0.0);
        for pair in timeline.windows(2) {
            assert_eq!(pair[0].1.end, pair[1].1.start);
        }
        assert_eq!(timeline.last().unwrap().1.end, 0.75);
        assert_eq!(
            timeline.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            vec!["Wait", "On", "Off", "Wait", "On", "Off"]
        );
    }

    #[test]
    fn states_are_keyed_by_first_visit_and_unvisited_are_marked() {
        let map = r2();
        let machine = loop_machine(&map);
        let record = materialize(&run(&map, &machine), &machine, &map).unwrap();

        assert_eq!(
            record.states.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["Wait", "On", "Off", "Never"]
        );
        let never = record.state("Never").unwrap();
        assert_eq!(never.len(), 1);
        assert!(never[0].start.is_nan() && never[0].end.is_nan());
        assert_eq!(
            record.visited_states().collect::<Vec<_>>(),
            vec!["Wait", "On", "Off"]
        );
        assert_eq!(
            record.state("Wait").unwrap(),
            &[Interval::new(0.0, 0.2), Interval::new(0.4, 0.5)]
        );
    }

    #[test]
    fn events_collect_every_timestamp_under_their_name() {
        let map = r2();
        let machine = loop_machine(&map);
        let record = materialize(&run(&map, &machine), &machine, &map).unwrap();

        assert_eq!(record.event("Port1In").unwrap(), &[0.2, 0.5]);
        assert_eq!(record.event("Tup").unwrap(), &[0.3, 0.4, 0.6]);
        assert_eq!(record.event("Port2In").unwrap(), &[0.75]);
        assert!(record.event("Port3In").is_none());
        assert!((record.trial_start_timestamp - 0.1).abs() < 1e-12);
    }

    #[test]
    fn session_keeps_records_raw_logs_and_start_times() {
        let map = r2();
        let machine = loop_machine(&map);
        let mut session = SessionData::new();
        session.add_trial(run(&map, &machine), &machine, &map).unwrap();
        session.add_trial(run(&map, &machine), &machine, &map).unwrap();

        assert_eq!(session.n_trials(), 2);
        assert_eq!(session.raw_events().len(), 2);
        assert_eq!(session.trials()[1].states.len(), 4);
        assert_eq!(session.trial_start_timestamps().len(), 2);
    }
}
