//! Command/response session with a connected state machine device.

use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::assembler::FinalizedStateMachine;
use crate::error::{CapacityError, NamingError, ProtocolError, Result};
use crate::hardware::{ChannelMap, HardwareDescription};
use crate::interpreter::{RawEventLog, TrialInterpreter};
use crate::transport::TypedLink;
use crate::trial::{SessionData, TrialRecord, materialize};
use crate::wire;

/// Host command bytes.
pub mod command {
    pub const HANDSHAKE: u8 = b'6';
    pub const HANDSHAKE_REPLY: u8 = b'5';
    pub const FIRMWARE_VERSION: u8 = b'F';
    pub const HARDWARE_DESCRIPTION: u8 = b'H';
    pub const ENABLE_INPUTS: u8 = b'E';
    pub const SYNC_CONFIG: u8 = b'K';
    pub const PROGRAM: u8 = crate::wire::PROGRAM_COMMAND;
    pub const RUN: u8 = b'R';
    pub const OVERRIDE_OUTPUT: u8 = b'O';
    pub const SERIAL_WRITE: u8 = b'U';
    pub const LOAD_SERIAL_MESSAGE: u8 = b'L';
    pub const RESET_SERIAL_MESSAGES: u8 = b'>';
    pub const DISCONNECT: u8 = b'Z';
}

/// Oldest firmware whose protocol matches this client.
pub const MIN_FIRMWARE_VERSION: u32 = 8;

/// Longest message the serial message library stores.
pub const MAX_SERIAL_MESSAGE_LEN: usize = 3;

/// Wire value for "no sync channel".
pub const NO_SYNC_CHANNEL: u8 = 255;

/// When the sync channel toggles.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SyncMode {
    /// High for the duration of each trial.
    PerTrial,
    /// Toggles on every state change.
    #[default]
    PerState,
}

impl SyncMode {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::PerTrial => 0,
            Self::PerState => 1,
        }
    }
}

/// Which inputs the device should report.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum InputEnablePolicy {
    /// BNC and wire inputs plus the first three ports.
    #[default]
    Default,
    /// One flag per input channel, in channel order.
    Mask(Vec<bool>),
}

/// Session settings applied during [`Device::connect`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    pub sync_channel: Option<u8>,
    pub sync_mode: SyncMode,
    pub input_enables: InputEnablePolicy,
    pub min_firmware: u32,
}

impl DeviceConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sync_channel: None,
            sync_mode: SyncMode::PerState,
            input_enables: InputEnablePolicy::Default,
            min_firmware: MIN_FIRMWARE_VERSION,
        }
    }

    #[must_use]
    pub const fn with_sync(mut self, channel: u8, mode: SyncMode) -> Self {
        self.sync_channel = Some(channel);
        self.sync_mode = mode;
        self
    }

    #[must_use]
    pub fn with_input_enables(mut self, policy: InputEnablePolicy) -> Self {
        self.input_enables = policy;
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel addressed by [`Device::manual_override`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OverrideTarget<'a> {
    /// Valve `n` (1-based) on the valve register.
    Valve(u8),
    /// Hardware serial channel `n` (1-based); the value is sent as one byte.
    Serial(u8),
    /// Any named output channel, e.g. `BNC1` or `PWM2`.
    Output(&'a str),
    /// Named input channel; not supported by the device.
    Input(&'a str),
}

/// Sends `H` and derives the channel map from the reply.
pub fn describe_hardware<S: Read + Write>(stream: &mut S) -> Result<ChannelMap> {
    let mut link = TypedLink::new(stream);
    request_hardware(&mut link)
}

fn request_hardware<S: Read + Write>(link: &mut TypedLink<S>) -> Result<ChannelMap> {
    link.write_bytes(&[command::HARDWARE_DESCRIPTION])?;
    let hardware = HardwareDescription::read_from(link)?;
    debug!(
        max_states = hardware.max_states,
        cycle_period = hardware.cycle_period,
        inputs = hardware.inputs.len(),
        outputs = hardware.outputs.len(),
        "hardware description"
    );
    ChannelMap::from_hardware(hardware)
}

/// A connected device and the program most recently sent to it.
#[derive(Debug)]
pub struct Device<S> {
    link: TypedLink<S>,
    config: DeviceConfig,
    firmware_version: u32,
    map: ChannelMap,
    machine: Option<FinalizedStateMachine>,
    new_program_sent: bool,
}

impl<S: Read + Write> Device<S> {
    /// Handshakes, checks firmware, loads the channel map, enables inputs and
    /// configures the sync channel.
    pub fn connect(stream: S, config: DeviceConfig) -> Result<Self> {
        let mut link = TypedLink::new(stream);

        link.write_bytes(&[command::HANDSHAKE])?;
        let reply = link.read_u8()?;
        if reply != command::HANDSHAKE_REPLY {
            return Err(ProtocolError::HandshakeMismatch {
                expected: command::HANDSHAKE_REPLY,
                received: reply,
            }
            .into());
        }

        link.write_bytes(&[command::FIRMWARE_VERSION])?;
        let firmware_version = link.read_u32()?;
        if firmware_version < config.min_firmware {
            return Err(ProtocolError::FirmwareTooOld {
                found: firmware_version,
                required: config.min_firmware,
            }
            .into());
        }

        let map = request_hardware(&mut link)?;

        let enables = match &config.input_enables {
            InputEnablePolicy::Default => map.default_input_enables(),
            InputEnablePolicy::Mask(mask) => {
                if mask.len() != map.hardware().inputs.len() {
                    return Err(CapacityError::MaskLength {
                        expected: map.hardware().inputs.len(),
                        found: mask.len(),
                    }
                    .into());
                }
                mask.clone()
            }
        };
        let mut message = vec![command::ENABLE_INPUTS];
        message.extend(enables.iter().map(|enabled| u8::from(*enabled)));
        link.write_bytes(&message)?;
        expect_ack(&mut link, "input enable mask")?;

        let sync = [
            command::SYNC_CONFIG,
            config.sync_channel.unwrap_or(NO_SYNC_CHANNEL),
            config.sync_mode.as_byte(),
        ];
        link.write_bytes(&sync)?;
        expect_ack(&mut link, "sync configuration")?;

        info!(
            firmware_version,
            events = map.event_count(),
            outputs = map.output_channels().len(),
            "connected"
        );

        Ok(Self {
            link,
            config,
            firmware_version,
            map,
            machine: None,
            new_program_sent: false,
        })
    }

    #[must_use]
    pub const fn firmware_version(&self) -> u32 {
        self.firmware_version
    }

    #[must_use]
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Program the next trial will run, if any has been sent.
    #[must_use]
    pub fn state_machine(&self) -> Option<&FinalizedStateMachine> {
        self.machine.as_ref()
    }

    #[must_use]
    pub fn get_ref(&self) -> &S {
        self.link.get_ref()
    }

    /// Mutable access to the stream; writing to it directly desynchronizes
    /// the session.
    pub fn get_mut(&mut self) -> &mut S {
        self.link.get_mut()
    }

    /// Re-reads the hardware description and replaces the channel map.
    ///
    /// A changed description discards the sent program, which was encoded
    /// against the old map.
    pub fn describe_hardware(&mut self) -> Result<&ChannelMap> {
        let map = request_hardware(&mut self.link)?;
        if map.hardware() != self.map.hardware() && self.machine.take().is_some() {
            warn!("hardware description changed, program must be sent again");
            self.new_program_sent = false;
        }
        self.map = map;
        Ok(&self.map)
    }

    /// Encodes and sends `machine` as one write.
    pub fn send_state_machine(&mut self, machine: &FinalizedStateMachine) -> Result<()> {
        let program = wire::encode(machine, &self.map)?;
        self.link.write_bytes(&program)?;
        info!(
            states = machine.state_count(),
            bytes = program.len(),
            "state machine sent"
        );
        self.machine = Some(machine.clone());
        self.new_program_sent = true;
        Ok(())
    }

    /// Starts a trial and returns its raw event log.
    pub fn run_trial_raw(&mut self) -> Result<RawEventLog> {
        let machine = self.machine.as_ref().ok_or(ProtocolError::NoProgram)?;
        self.link.write_bytes(&[command::RUN])?;
        if self.new_program_sent {
            self.new_program_sent = false;
            expect_ack(&mut self.link, "state machine")?;
        }
        let log = TrialInterpreter::new(machine, &self.map).run(&mut self.link)?;
        info!(
            events = log.events.len(),
            states = log.states.len(),
            "trial complete"
        );
        Ok(log)
    }

    /// Starts a trial and materializes its record.
    pub fn run_trial(&mut self) -> Result<TrialRecord> {
        let log = self.run_trial_raw()?;
        let machine = self.machine.as_ref().ok_or(ProtocolError::NoProgram)?;
        materialize(&log, machine, &self.map)
    }

    /// Starts a trial and appends it to `session`.
    pub fn run_trial_into<'s>(&mut self, session: &'s mut SessionData) -> Result<&'s TrialRecord> {
        let log = self.run_trial_raw()?;
        let machine = self.machine.as_ref().ok_or(ProtocolError::NoProgram)?;
        session.add_trial(log, machine, &self.map)
    }

    /// Forces an output to `value` outside of a trial.
    pub fn manual_override(&mut self, target: OverrideTarget<'_>, value: u8) -> Result<()> {
        let message = match target {
            OverrideTarget::Input(channel) => {
                return Err(NamingError::InputOverride {
                    channel: channel.to_string(),
                }
                .into());
            }
            OverrideTarget::Serial(channel) => [command::SERIAL_WRITE, channel, value],
            OverrideTarget::Valve(valve) => {
                let channel = self.output_index("ValveState")?;
                if !(1..=8).contains(&valve) {
                    return Err(CapacityError::IndexOutOfRange {
                        kind: "valve",
                        index: usize::from(valve),
                        available: 8,
                    }
                    .into());
                }
                let bits = if value > 0 { 1 << (valve - 1) } else { 0 };
                [command::OVERRIDE_OUTPUT, channel, bits]
            }
            OverrideTarget::Output(name) => {
                [command::OVERRIDE_OUTPUT, self.output_index(name)?, value]
            }
        };
        debug!(?target, value, "manual override");
        self.link.write_bytes(&message)
    }

    fn output_index(&self, name: &str) -> Result<u8> {
        self.map.output_channel_index(name).ok_or_else(|| {
            NamingError::UnknownOutputChannel {
                channel: name.to_string(),
            }
            .into()
        })
    }

    /// Stores `message` under `id` for serial channel `channel` (1-based).
    pub fn load_serial_message(&mut self, channel: u8, id: u8, message: &[u8]) -> Result<()> {
        if message.len() > MAX_SERIAL_MESSAGE_LEN {
            return Err(CapacityError::SerialMessageTooLong { len: message.len() }.into());
        }
        if id == 0 || channel == 0 || usize::from(channel) > self.map.uart_channel_count() {
            let (kind, index, available) = if id == 0 {
                ("serial message id", usize::from(id), 255)
            } else {
                (
                    "serial channel",
                    usize::from(channel),
                    self.map.uart_channel_count(),
                )
            };
            return Err(CapacityError::IndexOutOfRange {
                kind,
                index,
                available,
            }
            .into());
        }
        let mut bytes = vec![
            command::LOAD_SERIAL_MESSAGE,
            channel - 1,
            1,
            id,
            u8::try_from(message.len()).unwrap_or(u8::MAX),
        ];
        bytes.extend_from_slice(message);
        self.link.write_bytes(&bytes)?;
        expect_ack(&mut self.link, "serial message")
    }

    /// Clears every stored serial message.
    pub fn reset_serial_messages(&mut self) -> Result<()> {
        self.link.write_bytes(&[command::RESET_SERIAL_MESSAGES])?;
        expect_ack(&mut self.link, "serial message reset")
    }

    /// Ends the session and releases the stream.
    pub fn disconnect(mut self) -> Result<S> {
        self.link.write_bytes(&[command::DISCONNECT])?;
        info!("disconnected");
        Ok(self.link.into_inner())
    }
}

fn expect_ack<S: Read + Write>(link: &mut TypedLink<S>, command: &'static str) -> Result<()> {
    if link.read_u8()? == 0 {
        warn!(command, "device rejected command");
        return Err(ProtocolError::MissingAcknowledgment { command }.into());
    }
    Ok(())
}
