//! Canned protocols that exercise each transition band.

use core::time::Duration;

use bpod_core::{ChannelMap, FinalizedStateMachine, GlobalTimerConfig, Result, StateMachine};

/// A named protocol plus the stimuli that walk it to exit.
pub struct Demo {
    pub name: &'static str,
    pub summary: &'static str,
    pub stimuli: &'static [(&'static str, Duration)],
    build: fn(&mut StateMachine<'_>) -> Result<()>,
}

impl Demo {
    /// Assembles and finalizes the protocol for `map`.
    pub fn assemble(&self, map: &ChannelMap) -> Result<FinalizedStateMachine> {
        let mut machine = StateMachine::new(map);
        (self.build)(&mut machine)?;
        machine.finalize()
    }
}

impl core::fmt::Debug for Demo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Demo")
            .field("name", &self.name)
            .field("stimuli", &self.stimuli)
            .finish_non_exhaustive()
    }
}

pub const DEMOS: &[Demo] = &[
    Demo {
        name: "lights",
        summary: "three port lights in sequence, skipping ahead while Port2 is held",
        stimuli: &[("Port2In", Duration::from_millis(500))],
        build: light_chase,
    },
    Demo {
        name: "global-timer",
        summary: "two lights alternate until global timer 1 ends",
        stimuli: &[],
        build: global_timer_loop,
    },
    Demo {
        name: "timer-events",
        summary: "dim loop until global timer 1 starts, bright loop until it ends",
        stimuli: &[],
        build: timer_start_and_end,
    },
    Demo {
        name: "two-afc",
        summary: "center poke, cue, then a left (reward) or right (timeout) choice",
        stimuli: &[
            ("Port2In", Duration::from_millis(300)),
            ("Port2Out", Duration::from_millis(350)),
            ("Port1In", Duration::from_millis(900)),
            ("Port1Out", Duration::from_millis(950)),
        ],
        build: two_alternative_choice,
    },
];

/// Looks a demo up by name, ignoring ASCII case.
#[must_use]
pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name.eq_ignore_ascii_case(name))
}

fn light_chase(sma: &mut StateMachine<'_>) -> Result<()> {
    sma.set_condition(1, "Port2", 1)?;
    let second = Duration::from_secs(1);
    sma.declare_state("Port1Light", second, &[("Tup", "Port2Light")], &[("PWM1", 255)])?;
    sma.declare_state(
        "Port2Light",
        second,
        &[("Tup", "Port3Light"), ("Condition1", "Port3Light")],
        &[("PWM2", 255)],
    )?;
    sma.declare_state("Port3Light", second, &[("Tup", "exit")], &[("PWM3", 255)])?;
    Ok(())
}

fn global_timer_loop(sma: &mut StateMachine<'_>) -> Result<()> {
    sma.set_global_timer(
        1,
        GlobalTimerConfig::new(Duration::from_secs(3))
            .onset_delay(Duration::from_millis(1_500))
            .channel("BNC2"),
    )?;
    let lit = Duration::from_millis(250);
    sma.declare_state("TimerTrig", Duration::ZERO, &[("Tup", "Port1Lit")], &[("GlobalTimerTrig", 1)])?;
    sma.declare_state(
        "Port1Lit",
        lit,
        &[("Tup", "Port3Lit"), ("GlobalTimer1_End", "exit")],
        &[("PWM1", 255)],
    )?;
    sma.declare_state(
        "Port3Lit",
        lit,
        &[("Tup", "Port1Lit"), ("GlobalTimer1_End", "exit")],
        &[("PWM3", 255)],
    )?;
    Ok(())
}

fn timer_start_and_end(sma: &mut StateMachine<'_>) -> Result<()> {
    sma.set_global_timer(
        1,
        GlobalTimerConfig::new(Duration::from_secs(3))
            .onset_delay(Duration::from_millis(1_500))
            .channel("PWM2")
            .on_value(255),
    )?;
    let lit = Duration::from_millis(250);
    sma.declare_state("TimerTrig", Duration::ZERO, &[("Tup", "Port1Lit_Pre")], &[("GlobalTimerTrig", 1)])?;
    for (name, next, output) in [
        ("Port1Lit_Pre", "Port3Lit_Pre", "PWM1"),
        ("Port3Lit_Pre", "Port1Lit_Pre", "PWM3"),
    ] {
        sma.declare_state(
            name,
            lit,
            &[("Tup", next), ("GlobalTimer1_Start", "Port1Lit_Post")],
            &[(output, 16)],
        )?;
    }
    for (name, next, output) in [
        ("Port1Lit_Post", "Port3Lit_Post", "PWM1"),
        ("Port3Lit_Post", "Port1Lit_Post", "PWM3"),
    ] {
        sma.declare_state(
            name,
            lit,
            &[("Tup", next), ("GlobalTimer1_End", "exit")],
            &[(output, 255)],
        )?;
    }
    Ok(())
}

fn two_alternative_choice(sma: &mut StateMachine<'_>) -> Result<()> {
    sma.declare_state("WaitForCenter", Duration::ZERO, &[("Port2In", "Cue")], &[("PWM2", 255)])?;
    sma.declare_state("Cue", Duration::from_millis(100), &[("Tup", "WaitForChoice")], &[("BNC1", 1)])?;
    sma.declare_state(
        "WaitForChoice",
        Duration::from_secs(5),
        &[("Port1In", "Reward"), ("Port3In", "Punish"), ("Tup", "exit")],
        &[("PWM1", 255), ("PWM3", 255)],
    )?;
    sma.declare_state(
        "Reward",
        Duration::from_millis(100),
        &[("Tup", "exit")],
        &[("Valve", 1), ("SoftCode", 1)],
    )?;
    sma.declare_state("Punish", Duration::from_secs(2), &[("Tup", "exit")], &[("SoftCode", 2)])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use bpod_core::HardwareDescription;

    use super::*;

    #[test]
    fn every_demo_assembles_for_the_r2_board() {
        let map = ChannelMap::from_hardware(HardwareDescription::state_machine_r2()).unwrap();
        for demo in DEMOS {
            let machine = demo
                .assemble(&map)
                .unwrap_or_else(|error| panic!("{} failed: {error}", demo.name));
            assert!(machine.state_count() > 0, "{} has no states", demo.name);
        }
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(find("TWO-AFC").map(|demo| demo.name), Some("two-afc"));
        assert!(find("missing").is_none());
    }
}
