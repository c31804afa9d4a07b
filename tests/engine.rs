//! End-to-end jobs over the in-process driver: propagation, combiners,
//! aggregators, mutations, halting, and failure surfacing.

use std::sync::Arc;

use irongraph::testing::{SumGraph, agg_i64, id_value_pairs, isolated, ring};
use irongraph::{
    AggValue, AggregatorRegistration, ComputeContext, Edge, EngineConfig, GraphJob, I64Sum,
    LocalCoordination, PartitionLayout, SumCombiner, VecEdgeInput, VecVertexInput,
    VecVertexOutput, Vertex, VertexProgram, WorkerError,
};

fn config(workers: usize, partitions: u32, spill: &tempfile::TempDir) -> EngineConfig<SumGraph> {
    let mut config = EngineConfig::new(workers, partitions);
    config.spill_root = spill.path().to_path_buf();
    config
}

/* ===================== programs ===================== */

/// Floods the maximum vertex value through the graph.
struct MaxPropagate;

impl VertexProgram<SumGraph> for MaxPropagate {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        let best = messages.into_iter().max().unwrap_or(*vertex.value());
        if ctx.superstep() == 0 {
            ctx.send_message_to_all_edges(vertex, *vertex.value())?;
        } else if best > *vertex.value() {
            vertex.set_value(best);
            ctx.send_message_to_all_edges(vertex, best)?;
        }
        vertex.vote_to_halt();
        Ok(())
    }
}

/// Sends 1 along every edge in superstep 0; afterwards accumulates message
/// sums into the vertex value. Final value = in-degree.
struct CountInDegree;

impl VertexProgram<SumGraph> for CountInDegree {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        // Messages sent in superstep s are never visible in s itself.
        if ctx.superstep() == 0 {
            assert!(messages.is_empty(), "no message may arrive in the superstep it was sent");
            ctx.send_message_to_all_edges(vertex, 1)?;
        } else {
            *vertex.value_mut() += messages.into_iter().sum::<i64>();
        }
        vertex.vote_to_halt();
        Ok(())
    }
}

/// Aggregates every vertex value into a persistent sum each superstep and
/// runs a fixed number of rounds.
struct AggregateRounds {
    rounds: i64,
}

impl VertexProgram<SumGraph> for AggregateRounds {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        *vertex.value_mut() += messages.into_iter().sum::<i64>();
        ctx.aggregate("final-sum", AggValue::I64(*vertex.value()));
        if ctx.superstep() < self.rounds {
            ctx.send_message_to_all_edges(vertex, 1)?;
        } else {
            vertex.vote_to_halt();
        }
        Ok(())
    }
}

/// Requests graph mutations from superstep 0 and halts immediately.
struct MutateOnce;

impl VertexProgram<SumGraph> for MutateOnce {
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        _messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        if *vertex.id() == 0 {
            ctx.add_vertex_request(Vertex::new(100, 1000))?;
            ctx.add_edge_request(&0, Edge::new(100, 1))?;
        }
        if *vertex.id() == 3 {
            ctx.remove_vertex_request(&3)?;
        }
        vertex.vote_to_halt();
        Ok(())
    }
}

/// Fails compute for one specific vertex.
struct FailOn {
    id: u64,
}

impl VertexProgram<SumGraph> for FailOn {
    fn compute(
        &self,
        _ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        _messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(*vertex.id() != self.id, "poisoned vertex");
        vertex.vote_to_halt();
        Ok(())
    }
}

/* ===================== jobs ===================== */

#[test]
fn max_value_floods_a_ring_across_workers() {
    let spill = tempfile::tempdir().unwrap();
    let output = Arc::new(VecVertexOutput::new());
    let job = GraphJob::<SumGraph> {
        config: config(3, 6, &spill),
        program: Arc::new(MaxPropagate),
        vertex_input: Some(Arc::new(VecVertexInput::new(ring(8), 3))),
        edge_input: None,
        output: Some(output.clone()),
    };
    let result = job.run(LocalCoordination::new()).unwrap();

    let values = id_value_pairs(&output.sorted());
    assert_eq!(values.len(), 8);
    for (_, value) in values {
        assert_eq!(value, 7);
    }
    // One initial round plus seven hops around the ring, plus the final
    // quiescent round.
    assert!(result.supersteps >= 8);
    assert_eq!(result.stats.active_vertices, 0);
}

#[test]
fn halting_law_terminates_silent_jobs_after_one_superstep() {
    let spill = tempfile::tempdir().unwrap();
    let job = GraphJob::<SumGraph> {
        config: config(2, 4, &spill),
        program: Arc::new(CountInDegree),
        vertex_input: Some(Arc::new(VecVertexInput::new(isolated(5), 2))),
        edge_input: None,
        output: None,
    };
    // Isolated vertices send nothing; everything halts in superstep 0.
    let result = job.run(LocalCoordination::new()).unwrap();
    assert_eq!(result.supersteps, 1);
}

#[test]
fn combiner_and_plain_runs_deliver_equal_totals() {
    // A star: every vertex points at vertex 0.
    let star: Vec<Vertex<SumGraph>> = (0..10u64)
        .map(|i| {
            if i == 0 {
                Vertex::new(0, 0)
            } else {
                Vertex::with_edges(i, 0, vec![Edge::new(0, 1)])
            }
        })
        .collect();

    let mut outputs = Vec::new();
    for combined in [false, true] {
        let spill = tempfile::tempdir().unwrap();
        let output = Arc::new(VecVertexOutput::new());
        let mut cfg = config(2, 4, &spill);
        if combined {
            cfg.combiner = Some(Arc::new(SumCombiner::new()));
        }
        let job = GraphJob::<SumGraph> {
            config: cfg,
            program: Arc::new(CountInDegree),
            vertex_input: Some(Arc::new(VecVertexInput::new(star.clone(), 4))),
            edge_input: None,
            output: Some(output.clone()),
        };
        job.run(LocalCoordination::new()).unwrap();
        outputs.push(id_value_pairs(&output.sorted()));
    }

    // Combiner determinism: the combined total per vertex equals the sum of
    // the individually delivered messages.
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0][0], (0, 9));
}

#[test]
fn aggregator_totals_are_worker_count_invariant() {
    let mut results = Vec::new();
    for workers in [1usize, 3] {
        let spill = tempfile::tempdir().unwrap();
        let mut cfg = config(workers, 6, &spill);
        cfg.aggregators =
            vec![AggregatorRegistration::persistent("final-sum", Arc::new(I64Sum))];
        let job = GraphJob::<SumGraph> {
            config: cfg,
            program: Arc::new(AggregateRounds { rounds: 3 }),
            vertex_input: Some(Arc::new(VecVertexInput::new(ring(6), 2))),
            edge_input: None,
            output: None,
        };
        let result = job.run(LocalCoordination::new()).unwrap();
        results.push(agg_i64(&result.aggregators, "final-sum"));
    }
    assert_eq!(results[0], results[1]);
    assert!(results[0] > 0);
}

#[test]
fn mutations_apply_between_supersteps() {
    let spill = tempfile::tempdir().unwrap();
    let output = Arc::new(VecVertexOutput::new());
    let job = GraphJob::<SumGraph> {
        config: config(2, 4, &spill),
        program: Arc::new(MutateOnce),
        vertex_input: Some(Arc::new(VecVertexInput::new(isolated(6), 2))),
        edge_input: None,
        output: Some(output.clone()),
    };
    job.run(LocalCoordination::new()).unwrap();

    let pairs = id_value_pairs(&output.sorted());
    let ids: Vec<u64> = pairs.iter().map(|(id, _)| *id).collect();
    // Vertex 3 removed, vertex 100 adopted from the add-vertex request.
    assert_eq!(ids, vec![0, 1, 2, 4, 5, 100]);
    assert_eq!(pairs.last().unwrap().1, 1000);
    let zero = output.sorted().into_iter().find(|v| *v.id() == 0).unwrap();
    assert_eq!(zero.num_edges(), 1);
    assert_eq!(zero.edges()[0].target, 100);
}

#[test]
fn edge_input_synthesizes_vertices() {
    let spill = tempfile::tempdir().unwrap();
    let edges: Vec<(u64, Edge<SumGraph>)> =
        (0..5u64).map(|i| (i, Edge::new(i + 1, 1))).collect();
    let output = Arc::new(VecVertexOutput::new());
    let job = GraphJob::<SumGraph> {
        config: config(2, 4, &spill),
        program: Arc::new(CountInDegree),
        vertex_input: None,
        edge_input: Some(Arc::new(VecEdgeInput::new(edges, 2))),
        output: Some(output.clone()),
    };
    job.run(LocalCoordination::new()).unwrap();

    let pairs = id_value_pairs(&output.sorted());
    // Sources 0..4 synthesized from edges, vertex 5 from its message.
    assert_eq!(pairs.len(), 6);
    assert_eq!(pairs[0], (0, 0));
    for (id, value) in &pairs[1..] {
        assert_eq!(*value, 1, "vertex {id} should have in-degree 1");
    }
}

#[test]
fn out_of_core_and_byte_array_layout_run_end_to_end() {
    let spill = tempfile::tempdir().unwrap();
    let output = Arc::new(VecVertexOutput::new());
    let mut cfg = config(2, 8, &spill);
    cfg.partition_layout = PartitionLayout::ByteArray;
    cfg.use_out_of_core = true;
    cfg.max_partitions_in_memory = 1;
    let job = GraphJob::<SumGraph> {
        config: cfg,
        program: Arc::new(MaxPropagate),
        vertex_input: Some(Arc::new(VecVertexInput::new(ring(12), 5))),
        edge_input: None,
        output: Some(output.clone()),
    };
    job.run(LocalCoordination::new()).unwrap();

    let values = id_value_pairs(&output.sorted());
    assert_eq!(values.len(), 12);
    for (_, value) in values {
        assert_eq!(value, 11);
    }
}

#[test]
fn user_compute_failure_aborts_the_job_with_the_vertex() {
    let spill = tempfile::tempdir().unwrap();
    let job = GraphJob::<SumGraph> {
        config: config(2, 4, &spill),
        program: Arc::new(FailOn { id: 2 }),
        vertex_input: Some(Arc::new(VecVertexInput::new(isolated(4), 2))),
        edge_input: None,
        output: None,
    };
    let err = job.run(LocalCoordination::new()).unwrap_err();
    match err {
        WorkerError::Aborted(reason) => {
            assert!(reason.contains("vertex 2"), "unexpected abort reason: {reason}");
        }
        other => panic!("expected abort, got {other}"),
    }
}
