//! Port table of an Art-Net node

use common::{DmxBuffer, Error, PortDirection, PortInfo, Result};

/// Ports in each direction
pub const PORTS_PER_DIRECTION: usize = 4;

#[derive(Debug, Default)]
struct InputPort {
    universe: Option<u8>,
    latest: Option<DmxBuffer>,
}

#[derive(Debug, Default)]
struct OutputPort {
    universe: Option<u8>,
    sequence: u8,
}

impl OutputPort {
    /// 1..=255, wrapping past zero
    fn next_sequence(&mut self) -> u8 {
        self.sequence = match self.sequence {
            u8::MAX => 1,
            n => n + 1,
        };
        self.sequence
    }
}

/// Four input and four output ports with their patching
#[derive(Debug, Default)]
pub struct PortTable {
    inputs: [InputPort; PORTS_PER_DIRECTION],
    outputs: [OutputPort; PORTS_PER_DIRECTION],
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patch(&mut self, direction: PortDirection, port: u8, universe: Option<u8>) -> Result<()> {
        let index = port as usize;
        if index >= PORTS_PER_DIRECTION {
            return Err(Error::NoSuchPort(port));
        }
        match direction {
            PortDirection::Input => {
                let input = &mut self.inputs[index];
                if input.universe != universe {
                    input.latest = None;
                }
                input.universe = universe;
            }
            PortDirection::Output => self.outputs[index].universe = universe,
        }
        Ok(())
    }

    pub fn info(&self) -> Vec<PortInfo> {
        let inputs = self.inputs.iter().enumerate().map(|(i, port)| PortInfo {
            index: i as u8,
            direction: PortDirection::Input,
            universe: port.universe,
            description: describe(port.universe),
        });
        let outputs = self.outputs.iter().enumerate().map(|(i, port)| PortInfo {
            index: i as u8,
            direction: PortDirection::Output,
            universe: port.universe,
            description: describe(port.universe),
        });
        inputs.chain(outputs).collect()
    }

    pub fn input_universes(&self) -> [Option<u8>; PORTS_PER_DIRECTION] {
        std::array::from_fn(|i| self.inputs[i].universe)
    }

    pub fn output_universes(&self) -> [Option<u8>; PORTS_PER_DIRECTION] {
        std::array::from_fn(|i| self.outputs[i].universe)
    }

    /// Universe and sequence number for the next frame out of `port`
    ///
    /// `Ok(None)` when the port is not patched.
    pub fn next_output(&mut self, port: u8) -> Result<Option<(u8, u8)>> {
        let output = self
            .outputs
            .get_mut(port as usize)
            .ok_or(Error::NoSuchPort(port))?;
        Ok(output
            .universe
            .map(|universe| (universe, output.next_sequence())))
    }

    /// Store a received frame on every input patched to `universe`
    ///
    /// Returns the number of ports updated.
    pub fn store_input(&mut self, universe: u16, buffer: &DmxBuffer) -> usize {
        let mut updated = 0;
        for input in &mut self.inputs {
            if input.universe.is_some_and(|u| u as u16 == universe) {
                input.latest = Some(buffer.clone());
                updated += 1;
            }
        }
        updated
    }

    pub fn latest_input(&self, port: u8) -> Option<DmxBuffer> {
        self.inputs.get(port as usize)?.latest.clone()
    }
}

fn describe(universe: Option<u8>) -> String {
    match universe {
        Some(u) => format!("Art-Net Universe {}", u),
        None => "Art-Net (unpatched)".to_string(),
    }
}
