//! Master-observer callbacks around the application and every superstep.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use irongraph::testing::SumGraph;
use irongraph::{
    ComputeContext, EngineConfig, GraphJob, LocalCoordination, MasterObserver, SuperstepNumber,
    VecVertexInput, Vertex, VertexProgram,
};

#[derive(Default)]
struct Counts {
    pre_application: AtomicU64,
    post_application: AtomicU64,
    pre_superstep: AtomicU64,
    post_superstep: AtomicU64,
}

struct CountingObserver(Arc<Counts>);

impl MasterObserver for CountingObserver {
    fn pre_application(&self) {
        self.0.pre_application.fetch_add(1, Ordering::Relaxed);
    }

    fn post_application(&self) {
        self.0.post_application.fetch_add(1, Ordering::Relaxed);
    }

    fn pre_superstep(&self, _superstep: SuperstepNumber) {
        self.0.pre_superstep.fetch_add(1, Ordering::Relaxed);
    }

    fn post_superstep(&self, _superstep: SuperstepNumber) {
        self.0.post_superstep.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts compute calls in the vertex value and halts on the third.
struct HaltOnThirdCall;

impl VertexProgram<SumGraph> for HaltOnThirdCall {
    fn compute(
        &self,
        _ctx: &mut ComputeContext<'_, SumGraph>,
        vertex: &mut Vertex<SumGraph>,
        _messages: Vec<i64>,
    ) -> anyhow::Result<()> {
        *vertex.value_mut() += 1;
        if *vertex.value() >= 3 {
            vertex.vote_to_halt();
        }
        Ok(())
    }
}

#[test]
fn observers_fire_around_application_and_each_superstep() {
    let counts = Arc::new(Counts::default());
    let spill = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::<SumGraph>::new(2, 4);
    config.spill_root = spill.path().to_path_buf();
    // Two observer instances sharing one counter set.
    config.observers = vec![
        Arc::new(CountingObserver(Arc::clone(&counts))),
        Arc::new(CountingObserver(Arc::clone(&counts))),
    ];

    let vertices: Vec<Vertex<SumGraph>> = (0..3).map(|i| Vertex::new(i, 0)).collect();
    let job = GraphJob::<SumGraph> {
        config,
        program: Arc::new(HaltOnThirdCall),
        vertex_input: Some(Arc::new(VecVertexInput::new(vertices, 1))),
        edge_input: None,
        output: None,
    };
    let result = job.run(LocalCoordination::new()).unwrap();

    // Three compute supersteps before everything halts.
    assert_eq!(result.supersteps, 3);
    assert_eq!(counts.pre_application.load(Ordering::Relaxed), 2);
    assert_eq!(counts.post_application.load(Ordering::Relaxed), 2);
    // One input superstep plus three compute supersteps, times two observers.
    assert_eq!(counts.pre_superstep.load(Ordering::Relaxed), 8);
    assert_eq!(counts.post_superstep.load(Ordering::Relaxed), 8);
}
