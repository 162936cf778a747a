//! Console session driving a [`VirtualDevice`] through the host client.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use bpod_core::{Device, DeviceConfig, Error, OverrideTarget, SessionData, TrialRecord};
use tracing::{debug, info};

use crate::demos::{self, DEMOS};
use crate::device::VirtualDevice;
use crate::grammar::{self, Command};

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "hardware",
        "hardware                      - list channels and event bands",
    ),
    (
        "demos",
        "demos                         - list the built-in protocols",
    ),
    (
        "load",
        "load <demo>                   - assemble a demo, send it and schedule its stimuli",
    ),
    (
        "stim",
        "stim <event> [at] <duration>  - raise an input event in every following trial",
    ),
    (
        "clear",
        "clear                         - drop all scheduled stimuli",
    ),
    (
        "run",
        "run [count]                   - run trials and print their state timelines",
    ),
    (
        "trials",
        "trials                        - summarize the trials recorded so far",
    ),
    (
        "override",
        "override <output> <value>     - force an output channel outside a trial",
    ),
    (
        "help",
        "help [topic]                  - show help for a command",
    ),
];

/// Host client, virtual device and recorded trials for one console.
pub struct Session {
    device: Device<VirtualDevice>,
    data: SessionData,
    loaded: Option<&'static str>,
    transcript: Option<TranscriptLogger>,
    started_at: Instant,
}

impl Session {
    /// Connects to a fresh second-revision virtual board.
    pub fn new(transcript: Option<&Path>) -> Result<Self, Error> {
        let device = Device::connect(VirtualDevice::state_machine_r2()?, DeviceConfig::new())?;
        let transcript = transcript.map(TranscriptLogger::new).transpose()?;
        Ok(Self {
            device,
            data: SessionData::new(),
            loaded: None,
            transcript,
            started_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.record(elapsed, TranscriptRole::Host, &[trimmed.to_string()])?;

        let lines = match grammar::parse(trimmed) {
            Ok(command) => {
                debug!(?command, "console command");
                self.execute(command)
                    .unwrap_or_else(|error| vec![format!("ERR {error}")])
            }
            Err(err) => vec![format!("ERR syntax {err}")],
        };

        self.record(elapsed, TranscriptRole::Emulator, &lines)?;
        Ok(lines)
    }

    fn execute(&mut self, command: Command<'_>) -> Result<Vec<String>, Error> {
        match command {
            Command::Help { topic } => Ok(help(topic)),
            Command::Hardware => Ok(self.describe_hardware()),
            Command::Demos => Ok(DEMOS
                .iter()
                .map(|demo| format!("{:<14}{}", demo.name, demo.summary))
                .collect()),
            Command::Load { demo } => self.load(demo),
            Command::Stim { event, at } => {
                self.device.get_mut().add_stimulus(event, at)?;
                Ok(vec![format!("OK {event} at {:.3}s", at.as_secs_f64())])
            }
            Command::Clear => {
                self.device.get_mut().clear_stimuli();
                Ok(vec!["OK stimuli cleared".to_string()])
            }
            Command::Run { trials } => self.run(trials),
            Command::Trials => Ok(self.summarize_trials()),
            Command::Override { channel, value } => {
                self.device
                    .manual_override(OverrideTarget::Output(channel), value)?;
                Ok(vec![format!("OK {channel} = {value}")])
            }
        }
    }

    fn describe_hardware(&self) -> Vec<String> {
        let map = self.device.channel_map();
        let offsets = map.offsets();
        vec![
            format!(
                "firmware {}, {} states max, {:.0} Hz",
                self.device.firmware_version(),
                map.max_states(),
                map.tick_frequency()
            ),
            format!("inputs:  {}", map.input_channels().join(" ")),
            format!("outputs: {}", map.output_channels().join(" ")),
            format!(
                "events:  {} (timer start {}, timer end {}, counter {}, condition {}, Tup {})",
                map.event_count(),
                offsets.timer_start,
                offsets.timer_end,
                offsets.counter,
                offsets.condition,
                map.timeout_code()
            ),
        ]
    }

    fn load(&mut self, name: &str) -> Result<Vec<String>, Error> {
        let Some(demo) = demos::find(name) else {
            let names: Vec<&str> = DEMOS.iter().map(|demo| demo.name).collect();
            return Ok(vec![
                format!("ERR unknown demo `{name}`"),
                format!("Available demos: {}", names.join(", ")),
            ]);
        };

        let machine = demo.assemble(self.device.channel_map())?;
        self.device.send_state_machine(&machine)?;
        let virtual_device = self.device.get_mut();
        virtual_device.clear_stimuli();
        for (event, at) in demo.stimuli {
            virtual_device.add_stimulus(event, *at)?;
        }
        self.loaded = Some(demo.name);
        info!(demo = demo.name, states = machine.state_count(), "demo loaded");

        Ok(vec![format!(
            "OK {} loaded: {} states, {} stimuli",
            demo.name,
            machine.state_count(),
            demo.stimuli.len()
        )])
    }

    fn run(&mut self, trials: u32) -> Result<Vec<String>, Error> {
        let mut lines = Vec::new();
        for _ in 0..trials {
            let number = self.data.n_trials() + 1;
            let record = self.device.run_trial_into(&mut self.data)?;
            lines.extend(describe_trial(number, self.loaded, record));
        }
        Ok(lines)
    }

    fn summarize_trials(&self) -> Vec<String> {
        if self.data.n_trials() == 0 {
            return vec!["No trials recorded.".to_string()];
        }
        self.data
            .trials()
            .iter()
            .zip(self.data.trial_start_timestamps())
            .enumerate()
            .map(|(index, (trial, start))| {
                format!(
                    "trial {:>3}  start {start:>9.4}s  states {}  events {}",
                    index + 1,
                    trial.visited_states().count(),
                    trial.events.values().map(Vec::len).sum::<usize>()
                )
            })
            .collect()
    }

    fn record(&mut self, elapsed: Duration, role: TranscriptRole, lines: &[String]) -> io::Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => lines
                .iter()
                .try_for_each(|line| transcript.append_line(elapsed, role, line)),
            None => Ok(()),
        }
    }
}

fn help(topic: Option<&str>) -> Vec<String> {
    let Some(target) = topic else {
        let mut lines = vec!["Available commands:".to_string()];
        lines.extend(HELP_TOPICS.iter().map(|(_, detail)| format!("  {detail}")));
        lines.push("Type `help <topic>` for a specific command.".to_string());
        return lines;
    };

    if let Some((_, detail)) = HELP_TOPICS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(target))
    {
        vec![(*detail).to_string()]
    } else {
        let topics: Vec<&str> = HELP_TOPICS.iter().map(|(name, _)| *name).collect();
        vec![
            format!("No help available for `{target}`."),
            format!("Available topics: {}", topics.join(", ")),
        ]
    }
}

fn describe_trial(number: usize, demo: Option<&str>, record: &TrialRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "trial {number} ({})",
        demo.unwrap_or("custom program")
    )];
    for (name, interval) in record.timeline() {
        lines.push(format!(
            "  {name:<16}{:>8.3} -> {:>8.3}",
            interval.start, interval.end
        ));
    }
    for (name, times) in &record.events {
        let times: Vec<String> = times.iter().map(|time| format!("{time:.3}")).collect();
        lines.push(format!("  {name:<16}@ {}", times.join(", ")));
    }
    lines
}

struct TranscriptLogger {
    writer: BufWriter<File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# Bpod emulator transcript")?;
        writeln!(writer, "# Timestamps are milliseconds since session start")?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    fn append_line(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(None).expect("virtual device should connect")
    }

    #[test]
    fn help_lists_every_topic() {
        let lines = session().handle_command("help").unwrap();
        assert_eq!(lines.len(), HELP_TOPICS.len() + 2);
        let lines = session().handle_command("help nope").unwrap();
        assert!(lines[1].contains("override"));
    }

    #[test]
    fn syntax_errors_are_reported_inline() {
        let lines = session().handle_command("run $").unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ERR syntax"), "{lines:?}");
    }

    #[test]
    fn running_before_loading_reports_the_missing_program() {
        let lines = session().handle_command("run").unwrap();
        assert_eq!(
            lines,
            vec!["ERR no state machine has been sent to the device".to_string()]
        );
    }

    #[test]
    fn loading_and_running_a_demo_records_trials() {
        let mut session = session();
        let lines = session.handle_command("load lights").unwrap();
        assert!(lines[0].starts_with("OK lights loaded: 3 states"), "{lines:?}");

        let lines = session.handle_command("run 2").unwrap();
        assert_eq!(lines.iter().filter(|line| line.starts_with("trial")).count(), 2);
        assert_eq!(session.data().n_trials(), 2);

        let trial = &session.data().trials()[0];
        let visited: Vec<&str> = trial.visited_states().collect();
        assert_eq!(visited, ["Port1Light", "Port2Light", "Port3Light"]);
        assert_eq!(trial.state("Port3Light").unwrap()[0].start, 1.0);
        assert_eq!(trial.state("Port3Light").unwrap()[0].end, 2.0);

        let summary = session.handle_command("trials").unwrap();
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn unknown_names_surface_as_errors() {
        let mut session = session();
        let lines = session.handle_command("stim Port99In 1s").unwrap();
        assert!(lines[0].starts_with("ERR"), "{lines:?}");
        let lines = session.handle_command("load nothing").unwrap();
        assert_eq!(lines[0], "ERR unknown demo `nothing`");
        let lines = session.handle_command("override PWM1 255").unwrap();
        assert_eq!(lines, vec!["OK PWM1 = 255".to_string()]);
    }
}
