use core::time::Duration;

use bpod_core::{ChannelMap, EventBand, HardwareDescription, StateMachine, Target};

fn r2() -> ChannelMap {
    ChannelMap::from_hardware(HardwareDescription::state_machine_r2())
        .expect("r2 hardware should produce a channel map")
}

#[test]
fn every_event_code_lands_in_exactly_one_table() {
    let map = r2();
    for code in 0..u8::try_from(map.event_count()).expect("event count fits a byte") {
        let name = map.event_name(code).expect("every code has a name").to_string();
        let mut sma = StateMachine::new(&map);
        sma.declare_state("S", Duration::ZERO, &[(name.as_str(), "T")], &[])
            .expect("S should declare");
        sma.declare_state("T", Duration::ZERO, &[], &[])
            .expect("T should declare");
        let machine = sma.finalize().expect("machine should finalize");
        let state = machine.state(0).expect("state S exists");

        let band = map.band(code).expect("code is in range");
        let tables = [
            (EventBand::Input, state.input.len()),
            (EventBand::TimerStart, state.timer_start.len()),
            (EventBand::TimerEnd, state.timer_end.len()),
            (EventBand::Counter, state.counter.len()),
            (EventBand::Condition, state.condition.len()),
        ];
        let timer_routed = state.state_timer == Target::State(1);
        let populated: Vec<EventBand> = tables
            .iter()
            .filter(|(_, len)| *len > 0)
            .map(|(band, _)| *band)
            .chain(timer_routed.then_some(EventBand::Timeout))
            .collect();

        assert_eq!(populated, vec![band], "{name} (code {code}) routed to {populated:?}");
    }
}

#[test]
fn jump_events_share_the_condition_table() {
    let map = r2();
    for name in ["Serial1Jump", "Serial3Jump", "SoftJump"] {
        let code = map.event_code(name).expect("jump event exists");
        assert!(map.is_jump(code));
        assert_eq!(map.band(code), Some(EventBand::Condition));
    }
}
