//! The codec pipeline: ordered encoders applied on send, and ordered decode
//! stages applied on receive, each stage keeping its own leftover bytes.
//!
//! A decoder is called repeatedly with everything its stage has buffered
//! until it reports zero bytes consumed, which means it needs more input.
//! Whatever it produces is fed to the next stage; the last stage's output
//! are the fully decoded units.
//!
//! If a stage rejects its input, the pipeline turns raw: encoders are
//! dropped and input is handed back untouched from then on. A sniffing
//! pipeline also keeps a copy of the raw input until the first unit comes
//! out of the last stage, so the bytes handed back on failure start at the
//! very first byte received. The owner can then relay them elsewhere instead
//! of closing on whoever sent them.
use core::fmt::Debug;

use tracing::{debug, warn};

use crate::{error::CodecError, specification::SNIFF_WINDOW};

/// A transform applied to outbound bytes.
pub trait Encode: Debug + Send {
    /// Transforms one chunk of outbound bytes.
    fn encode(&mut self, data: Vec<u8>) -> Vec<u8>;
}

/// A transform applied to inbound bytes.
pub trait Decode: Debug + Send {
    /// Decodes a prefix of `input`.
    ///
    /// Returning zero bytes consumed means more input is needed.
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError>;

    /// A short name for logs and errors.
    fn name(&self) -> &'static str;
}

/// The result of one decoder call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Decoded {
    /// Units produced, possibly none.
    pub units: Vec<Vec<u8>>,
    /// Bytes of the input consumed.
    pub consumed: usize,
}

impl Decoded {
    /// Consumed `consumed` bytes and produced `unit`.
    pub fn unit(unit: Vec<u8>, consumed: usize) -> Self {
        Self {
            units: vec![unit],
            consumed,
        }
    }

    /// Consumed `consumed` bytes and produced nothing.
    pub fn skipped(consumed: usize) -> Self {
        Self {
            units: Vec::new(),
            consumed,
        }
    }

    /// Needs more input.
    pub fn incomplete() -> Self {
        Self::default()
    }
}

/// What came out of the pipeline for one chunk of input.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Output {
    /// Fully decoded units, possibly none.
    Units(Vec<Vec<u8>>),
    /// The pipeline is raw; these are undecoded bytes.
    Raw {
        /// Units decoded from the same input before the failure.
        decoded: Vec<Vec<u8>>,
        /// Bytes to hand over.
        bytes: Vec<u8>,
        /// Set on the chunk that turned the pipeline raw.
        first: bool,
    },
}

#[derive(Debug)]
struct Stage {
    decoder: Box<dyn Decode>,
    leftover: Vec<u8>,
}

/// An ordered chain of encoders and decode stages.
#[derive(Debug, Default)]
pub struct Pipeline {
    encoders: Vec<Box<dyn Encode>>,
    stages: Vec<Stage>,
    sniffed: Option<Vec<u8>>,
    raw: bool,
}

impl Pipeline {
    /// An empty pipeline passes bytes through untouched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an encoder. Encoders run in the order they were appended.
    pub fn push_encoder(&mut self, encoder: impl Encode + 'static) {
        self.encoders.push(Box::new(encoder));
    }

    /// Appends a decode stage. Stages run in the order they were appended.
    pub fn push_decoder(&mut self, decoder: impl Decode + 'static) {
        self.stages.push(Stage {
            decoder: Box::new(decoder),
            leftover: Vec::new(),
        });
    }

    /// Keeps the raw input until the first unit is decoded, so that a
    /// failure hands back everything received so far.
    ///
    /// Producing no unit within the sniffing window counts as a failure.
    pub fn sniff(&mut self) {
        if !self.raw && self.sniffed.is_none() {
            self.sniffed = Some(Vec::new());
        }
    }

    /// Drops all encoders; later sends go out unchanged.
    pub fn clear_encoders(&mut self) {
        self.encoders.clear();
    }

    /// Whether decoding failed and input is passed through raw.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Whether the pipeline transforms nothing.
    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty() && self.stages.is_empty()
    }

    /// Runs `data` through every encoder.
    pub fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        self.encoders
            .iter_mut()
            .fold(data, |data, encoder| encoder.encode(data))
    }

    /// Runs `data` through every decode stage.
    pub fn decode(&mut self, data: &[u8]) -> Output {
        if self.raw {
            return Output::Raw {
                decoded: Vec::new(),
                bytes: data.to_vec(),
                first: false,
            };
        }
        if self.stages.is_empty() {
            return Output::Units(if data.is_empty() {
                Vec::new()
            } else {
                vec![data.to_vec()]
            });
        }
        if let Some(history) = self.sniffed.as_mut() {
            history.extend_from_slice(data);
        }

        let mut units = Vec::new();
        let result = run_stages(&mut self.stages, data, &mut units).and_then(|()| {
            match self.sniffed.as_ref() {
                Some(history) if units.is_empty() && history.len() > SNIFF_WINDOW => {
                    Err(CodecError::SniffWindowExceeded {
                        buffered: history.len(),
                    })
                }
                _ => Ok(()),
            }
        });

        match result {
            Ok(()) => {
                if !units.is_empty() && self.sniffed.take().is_some() {
                    debug!("first unit decoded");
                }
                Output::Units(units)
            }
            Err(err) => {
                warn!(%err, "decode failed, passing input through raw");
                self.raw = true;
                self.encoders.clear();
                self.stages.clear();
                let bytes = match self.sniffed.take() {
                    Some(history) => history,
                    None => data.to_vec(),
                };
                Output::Raw {
                    decoded: units,
                    bytes,
                    first: true,
                }
            }
        }
    }
}

fn run_stages(
    stages: &mut [Stage],
    data: &[u8],
    units: &mut Vec<Vec<u8>>,
) -> Result<(), CodecError> {
    let Some((stage, rest)) = stages.split_first_mut() else {
        if !data.is_empty() {
            units.push(data.to_vec());
        }
        return Ok(());
    };

    stage.leftover.extend_from_slice(data);
    while !stage.leftover.is_empty() {
        let decoded = stage.decoder.decode(&stage.leftover)?;
        if decoded.consumed == 0 {
            break;
        }
        if decoded.consumed > stage.leftover.len() {
            return Err(CodecError::OverConsumed {
                stage: stage.decoder.name(),
            });
        }
        stage.leftover.drain(..decoded.consumed);
        for unit in decoded.units {
            run_stages(rest, &unit, units)?;
        }
    }
    Ok(())
}
