//! Checkpoint-restart: a rerun resuming from a mid-job checkpoint must
//! reproduce the original output and aggregator values.

#![cfg(feature = "checkpointing")]

use std::path::Path;
use std::sync::Arc;

use irongraph::testing::{SumGraph, agg_i64, ring};
use irongraph::{
    AggValue, AggregatorRegistration, CheckpointOptions, ComputeContext, EngineConfig, GraphJob,
    I64Sum, JobResult, LocalCoordination, SuperstepNumber, TextVertexOutput, VecVertexInput,
    Vertex, VertexProgram,
};

/// Accumulates message sums, aggregates every value into a persistent sum,
/// and runs a fixed number of rounds.
struct AccumulateRounds {
    rounds: SuperstepNumber,
}

impl VertexProgram<SumGraph> for AccumulateRounds {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        *vertex.value_mut() += messages.into_iter().sum::<i64>();
        ctx.aggregate("final-sum", AggValue::I64(*vertex.value()));
        if ctx.superstep() < self.rounds {
            ctx.send_message_to_all_edges(vertex, *vertex.value())?;
        } else {
            vertex.vote_to_halt();
        }
        Ok(())
    }
}

fn run_job(
    checkpoint_dir: &Path,
    output_dir: &Path,
    spill_dir: &Path,
    restart: Option<SuperstepNumber>,
) -> JobResult {
    let mut config = EngineConfig::<SumGraph>::new(2, 4);
    config.spill_root = spill_dir.to_path_buf();
    config.checkpoint = CheckpointOptions {
        directory: checkpoint_dir.to_path_buf(),
        frequency: 1,
        cleanup_after_success: false,
    };
    config.restart_superstep = restart;
    config.aggregators = vec![AggregatorRegistration::persistent("final-sum", Arc::new(I64Sum))];

    let job = GraphJob::<SumGraph> {
        config,
        program: Arc::new(AccumulateRounds { rounds: 5 }),
        vertex_input: Some(Arc::new(VecVertexInput::new(ring(8), 3))),
        edge_input: None,
        output: Some(Arc::new(TextVertexOutput::new(output_dir))),
    };
    job.run(LocalCoordination::new()).unwrap()
}

fn part_files(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut parts: Vec<(String, Vec<u8>)> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (entry.file_name().to_string_lossy().into_owned(), std::fs::read(entry.path()).unwrap())
        })
        .collect();
    parts.sort();
    parts
}

#[test]
fn restart_reproduces_output_and_final_sum() {
    let checkpoints = tempfile::tempdir().unwrap();
    let first_out = tempfile::tempdir().unwrap();
    let first_spill = tempfile::tempdir().unwrap();

    let first = run_job(checkpoints.path(), first_out.path(), first_spill.path(), None);
    assert_eq!(first.supersteps, 6);
    // Every boundary left a checkpoint, including the restart point.
    assert!(checkpoints.path().join("superstep-3").join("worker-0.ckpt").exists());
    assert!(checkpoints.path().join("superstep-3").join("worker-1.ckpt").exists());

    let second_out = tempfile::tempdir().unwrap();
    let second_spill = tempfile::tempdir().unwrap();
    let second = run_job(checkpoints.path(), second_out.path(), second_spill.path(), Some(3));
    assert_eq!(second.supersteps, 6);

    // Aggregator state resumed mid-accumulation must land on the same final
    // sum, and the rewritten output must match byte for byte.
    assert_eq!(
        agg_i64(&first.aggregators, "final-sum"),
        agg_i64(&second.aggregators, "final-sum")
    );
    let first_parts = part_files(first_out.path());
    let second_parts = part_files(second_out.path());
    let total = |parts: &[(String, Vec<u8>)]| parts.iter().map(|(_, b)| b.len()).sum::<usize>();
    assert_eq!(total(&first_parts), total(&second_parts));
    assert_eq!(first_parts, second_parts);
}
