//! Reader stack that owns every layer it opened.
//!
//! Decompressors do not close the reader underneath them, and a network body or
//! file handle must be released even when a decoder fails half way through
//! construction. `LayeredStream` keeps every layer in an ordered list,
//! outermost (raw source) first. Reads always go to the innermost layer and
//! [`LayeredStream::close`] releases layers innermost-first.

use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

type Slot = Arc<Mutex<Option<Box<dyn Read + Send>>>>;

/// A single owned layer in a [`LayeredStream`].
struct Layer {
    name: &'static str,
    slot: Slot,
}

impl Layer {
    fn new(name: &'static str, reader: Box<dyn Read + Send>) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Some(reader))),
        }
    }

    /// Drops the owned reader. Closing twice is a no-op.
    fn close(&self) {
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            trace!(layer = self.name, "Closed stream layer");
        }
    }

    fn reader(&self) -> LayerReader {
        LayerReader {
            name: self.name,
            slot: Arc::clone(&self.slot),
        }
    }
}

/// Read access to a layer that stays owned by the stream.
///
/// Handed to the constructor of the next layer so that decoders read from the
/// layer below without taking ownership of it.
pub struct LayerReader {
    name: &'static str,
    slot: Slot,
}

impl Read for LayerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| io::Error::other(format!("{} layer lock poisoned", self.name)))?;
        match guard.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} layer is closed", self.name),
            )),
        }
    }
}

impl fmt::Debug for LayerReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerReader").field("name", &self.name).finish()
    }
}

/// An ordered stack of nested readers, outermost first.
pub struct LayeredStream {
    layers: Vec<Layer>,
}

impl LayeredStream {
    /// Creates a stream whose only layer is the raw source.
    pub fn new(name: &'static str, source: impl Read + Send + 'static) -> Self {
        Self {
            layers: vec![Layer::new(name, Box::new(source))],
        }
    }

    /// Stacks a new innermost layer built on top of the current innermost one.
    ///
    /// If `build` fails, every layer already in the stream is closed before the
    /// error is returned.
    pub fn push_with<F, R>(&mut self, name: &'static str, build: F) -> io::Result<()>
    where
        F: FnOnce(LayerReader) -> io::Result<R>,
        R: Read + Send + 'static,
    {
        let below = match self.layers.last() {
            Some(layer) => layer.reader(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream has no source layer",
                ));
            }
        };

        match build(below) {
            Ok(reader) => {
                trace!(layer = name, depth = self.layers.len() + 1, "Stacked stream layer");
                self.layers.push(Layer::new(name, Box::new(reader)));
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Number of layers in the stream, including the source.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Names of the layers, outermost first.
    #[must_use]
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name).collect()
    }

    /// Releases every layer, innermost first. Safe to call more than once.
    pub fn close(&mut self) {
        for layer in self.layers.iter().rev() {
            layer.close();
        }
    }
}

impl Read for LayeredStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.layers.last() {
            Some(layer) => layer.reader().read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for LayeredStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LayeredStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredStream")
            .field("layers", &self.layer_names())
            .finish()
    }
}
