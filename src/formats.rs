//! Input and output driver interfaces.
//!
//! The runtime consumes graphs only through these traits: a vertex input
//! format yields a lazy, restartable sequence of vertices over an opaque
//! split; an edge input format yields `(source id, edge)` pairs; an output
//! format accepts the final vertices. Concrete drivers (file formats,
//! databases) live outside the engine -- the in-memory and text
//! implementations here cover tests and small jobs.

use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::graph::{Edge, GraphTypes, Vertex};
use crate::rpc::WorkerId;

/// An opaque unit of input work, reserved by exactly one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSplit {
    /// Dense index of the split within its format.
    pub index: usize,
}

/// Produces vertices over splits.
pub trait VertexInputFormat<G: GraphTypes>: Send + Sync {
    /// Describe the available splits; `requested` is a sizing hint.
    fn splits(&self, requested: usize) -> Result<Vec<InputSplit>>;

    /// Open one split. The sequence is restartable: opening the same split
    /// twice yields the same vertices.
    fn open(
        &self,
        split: &InputSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<Vertex<G>>> + Send + '_>>;
}

/// Produces `(source id, edge)` pairs over splits.
pub trait EdgeInputFormat<G: GraphTypes>: Send + Sync {
    /// Describe the available splits; `requested` is a sizing hint.
    fn splits(&self, requested: usize) -> Result<Vec<InputSplit>>;

    /// Open one split.
    fn open(
        &self,
        split: &InputSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<(G::Id, Edge<G>)>> + Send + '_>>;
}

/// Sink for one worker's share of the final graph.
pub trait VertexWriter<G: GraphTypes>: Send {
    /// Write one vertex.
    fn write_vertex(&mut self, vertex: &Vertex<G>) -> Result<()>;

    /// Flush and finish.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accepts the final vertices, one writer per worker.
pub trait VertexOutputFormat<G: GraphTypes>: Send + Sync {
    /// Open the writer for `worker`.
    fn writer(&self, worker: WorkerId) -> Result<Box<dyn VertexWriter<G>>>;
}

/* ===================== in-memory drivers ===================== */

/// Vertex input over an in-memory vector, chunked into splits.
pub struct VecVertexInput<G: GraphTypes> {
    vertices: Vec<Vertex<G>>,
    split_size: usize,
}

impl<G: GraphTypes> VecVertexInput<G> {
    /// Build an input over `vertices`, `split_size` vertices per split.
    pub fn new(vertices: Vec<Vertex<G>>, split_size: usize) -> Self {
        Self { vertices, split_size: split_size.max(1) }
    }
}

impl<G: GraphTypes> VertexInputFormat<G> for VecVertexInput<G> {
    fn splits(&self, _requested: usize) -> Result<Vec<InputSplit>> {
        let count = self.vertices.len().div_ceil(self.split_size);
        Ok((0..count).map(|index| InputSplit { index }).collect())
    }

    fn open(
        &self,
        split: &InputSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<Vertex<G>>> + Send + '_>> {
        let start = split.index * self.split_size;
        let end = (start + self.split_size).min(self.vertices.len());
        Ok(Box::new(self.vertices[start..end].iter().cloned().map(Ok)))
    }
}

/// Edge input over an in-memory vector, chunked into splits.
pub struct VecEdgeInput<G: GraphTypes> {
    edges: Vec<(G::Id, Edge<G>)>,
    split_size: usize,
}

impl<G: GraphTypes> VecEdgeInput<G> {
    /// Build an input over `edges`, `split_size` edges per split.
    pub fn new(edges: Vec<(G::Id, Edge<G>)>, split_size: usize) -> Self {
        Self { edges, split_size: split_size.max(1) }
    }
}

impl<G: GraphTypes> EdgeInputFormat<G> for VecEdgeInput<G> {
    fn splits(&self, _requested: usize) -> Result<Vec<InputSplit>> {
        let count = self.edges.len().div_ceil(self.split_size);
        Ok((0..count).map(|index| InputSplit { index }).collect())
    }

    fn open(
        &self,
        split: &InputSplit,
    ) -> Result<Box<dyn Iterator<Item = Result<(G::Id, Edge<G>)>> + Send + '_>> {
        let start = split.index * self.split_size;
        let end = (start + self.split_size).min(self.edges.len());
        Ok(Box::new(self.edges[start..end].iter().cloned().map(Ok)))
    }
}

/// Collects output vertices in memory, shared across workers. Test driver.
pub struct VecVertexOutput<G: GraphTypes> {
    collected: Arc<Mutex<Vec<Vertex<G>>>>,
}

impl<G: GraphTypes> VecVertexOutput<G> {
    /// Build an empty collector.
    pub fn new() -> Self {
        Self { collected: Arc::new(Mutex::new(Vec::new())) }
    }

    /// All written vertices, ascending by id.
    pub fn sorted(&self) -> Vec<Vertex<G>> {
        let mut out = self.collected.lock().clone();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }
}

impl<G: GraphTypes> Default for VecVertexOutput<G> {
    fn default() -> Self {
        Self::new()
    }
}

struct VecWriter<G: GraphTypes> {
    collected: Arc<Mutex<Vec<Vertex<G>>>>,
}

impl<G: GraphTypes> VertexWriter<G> for VecWriter<G> {
    fn write_vertex(&mut self, vertex: &Vertex<G>) -> Result<()> {
        self.collected.lock().push(vertex.clone());
        Ok(())
    }
}

impl<G: GraphTypes> VertexOutputFormat<G> for VecVertexOutput<G> {
    fn writer(&self, _worker: WorkerId) -> Result<Box<dyn VertexWriter<G>>> {
        Ok(Box::new(VecWriter { collected: Arc::clone(&self.collected) }))
    }
}

/* ===================== text output ===================== */

/// Writes `id<TAB>value` lines, one `part-<worker>.txt` file per worker.
pub struct TextVertexOutput<G: GraphTypes> {
    directory: PathBuf,
    format_line: Arc<dyn Fn(&Vertex<G>) -> String + Send + Sync>,
}

impl<G: GraphTypes> TextVertexOutput<G> {
    /// Build an output writing under `directory` with the default
    /// `id<TAB>value` line format.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            format_line: Arc::new(|v| format!("{:?}\t{:?}", v.id(), v.value())),
        }
    }

    /// Replace the line formatter.
    pub fn with_formatter(
        mut self,
        format_line: Arc<dyn Fn(&Vertex<G>) -> String + Send + Sync>,
    ) -> Self {
        self.format_line = format_line;
        self
    }
}

struct TextWriter<G: GraphTypes> {
    out: BufWriter<File>,
    format_line: Arc<dyn Fn(&Vertex<G>) -> String + Send + Sync>,
}

impl<G: GraphTypes> VertexWriter<G> for TextWriter<G> {
    fn write_vertex(&mut self, vertex: &Vertex<G>) -> Result<()> {
        let line = (self.format_line)(vertex);
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl<G: GraphTypes> VertexOutputFormat<G> for TextVertexOutput<G> {
    fn writer(&self, worker: WorkerId) -> Result<Box<dyn VertexWriter<G>>> {
        create_dir_all(&self.directory)?;
        let file = File::create(self.directory.join(format!("part-{worker}.txt")))?;
        Ok(Box::new(TextWriter { out: BufWriter::new(file), format_line: Arc::clone(&self.format_line) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SumGraph;

    #[test]
    fn vec_input_splits_are_restartable() {
        let vertices: Vec<Vertex<SumGraph>> =
            (0..10).map(|i| Vertex::new(i, i as i64)).collect();
        let input = VecVertexInput::new(vertices, 4);
        let splits = input.splits(0).unwrap();
        assert_eq!(splits.len(), 3);

        let first: Vec<_> = input.open(&splits[0]).unwrap().map(Result::unwrap).collect();
        let again: Vec<_> = input.open(&splits[0]).unwrap().map(Result::unwrap).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first.len(), again.len());
        assert_eq!(first[0].id(), again[0].id());

        let last: Vec<_> = input.open(&splits[2]).unwrap().map(Result::unwrap).collect();
        assert_eq!(last.len(), 2);
    }
}
