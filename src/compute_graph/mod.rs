//! The deferred graph behind lazy arrays: traversal, optimization and resolution.
//!
//! Nodes are the arrays themselves. A lazy array's descriptor points at its operand
//! arrays, so the graph reachable from a root is walked by following descriptors
//! until materialized arrays are reached.

use std::collections::{HashMap, HashSet};

mod canonicalize;
mod constant_folding;
mod fusion;
mod resolve;
mod view_pruning;
mod visualize;

pub(crate) use resolve::resolve;

use crate::array::{NodeId, StridedArray};

/// Lazy nodes reachable from `root`, every operand before its consumers.
pub(crate) fn post_order(root: &StridedArray) -> Vec<StridedArray> {
    fn visit(node: &StridedArray, visited: &mut HashSet<NodeId>, order: &mut Vec<StridedArray>) {
        if !node.is_lazy() || !visited.insert(node.id()) {
            return;
        }
        let Some(descriptor) = node.descriptor() else {
            return;
        };
        for operand in &descriptor.operands {
            visit(operand, visited, order);
        }
        order.push(node.clone());
    }

    let mut order = Vec::new();
    visit(root, &mut HashSet::new(), &mut order);
    order
}

/// How many nodes of `nodes` read each array. Repeated reads by one node count once.
pub(crate) fn consumer_counts(nodes: &[StridedArray]) -> HashMap<NodeId, usize> {
    let mut counts = HashMap::new();
    for node in nodes {
        let Some(descriptor) = node.descriptor() else {
            continue;
        };
        let mut seen = HashSet::new();
        for operand in &descriptor.operands {
            if seen.insert(operand.id()) {
                *counts.entry(operand.id()).or_default() += 1;
            }
        }
    }
    counts
}

/// Whether computing `root` reads memory owned by `target`.
pub(crate) fn reads_buffer_of(root: &StridedArray, target: &StridedArray) -> bool {
    if root.shares_buffer(target) {
        return true;
    }
    post_order(root).iter().any(|node| {
        node.descriptor().is_some_and(|descriptor| {
            descriptor
                .operands
                .iter()
                .any(|operand| operand.shares_buffer(target))
        })
    })
}

/// Rewrite the graph behind `root` with every pass the device enables.
pub(crate) fn optimize(root: &StridedArray) {
    let config = root.device().config();
    let optimizer = config.optimizer;
    let log_graph = config.log_graph;
    let before = post_order(root).len();
    let report = |pass: &str| {
        if log_graph {
            log::debug!("after {pass}: {} nodes", post_order(root).len());
        }
    };

    canonicalize::run(root);
    report("operand canonicalization");
    if optimizer.viewop_pruning {
        view_pruning::run(root);
        report("view pruning");
    }
    if optimizer.constant_folding {
        constant_folding::run(root);
        report("constant folding");
    }
    if optimizer.elementwise_fusion {
        fusion::elementwise(root);
        report("elementwise fusion");
    }
    if optimizer.processing_fusion {
        fusion::processing(root);
        report("processing fusion");
    }

    log::debug!(
        "optimized graph from {before} to {} nodes",
        post_order(root).len()
    );
    if log_graph {
        log::debug!("{}", visualize::graphviz(root));
    }
}

impl StridedArray {
    /// Lazy nodes that forcing this array would still execute, itself included.
    pub fn graph_node_count(&self) -> usize {
        post_order(self).len()
    }

    /// The lazy graph behind this array in graphviz DOT syntax.
    pub fn graphviz(&self) -> String {
        visualize::graphviz(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{DeviceConfig, OptimizerConfig},
        operation::{ElementwiseOp, Operator, ReduceOp},
        test_util::test_device_with,
        HostArray, StridedArray,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn assert_close(a: &HostArray, b: &HostArray) {
        assert_eq!(a.shape(), b.shape());
        for (a, b) in a.as_slice().iter().zip(b.as_slice()) {
            assert!((a - b).abs() <= 1e-4 * b.abs().max(1.0), "{a} != {b}");
        }
    }

    #[tokio::test]
    async fn single_consumer_chains_fuse_into_one_kernel() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::new(&device, &[[1., 2., 3.], [4., 5., 6.]]).unwrap();
        let y = x.neg().unwrap().exp().unwrap().add(&x).unwrap().relu().unwrap();
        assert_eq!(y.graph_node_count(), 4);
        let result = y.to_host().unwrap();
        assert_eq!(device.kernel_stats().total_launches(), 1);
        assert_eq!(
            device
                .kernel_stats()
                .launches(Operator::Elementwise(ElementwiseOp::Relu)),
            1
        );
        for (value, x) in result.as_slice().iter().zip(1..=6) {
            let x = x as f32;
            assert!((value - ((-x).exp() + x)).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn shared_consumers_split_kernels() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::new(&device, &[[1., 2.], [3., 4.]]).unwrap();

        // Both readers of `shared` end up in the same kernel.
        let shared = x.exp().unwrap();
        let y = shared.exp().unwrap().add(&shared.log().unwrap()).unwrap();
        let result = y.to_host().unwrap();
        assert_eq!(device.kernel_stats().total_launches(), 1);
        for (value, x) in result.as_slice().iter().zip(1..=4) {
            let e = (x as f32).exp();
            assert!((value - (e.exp() + x as f32)).abs() <= 1e-4 * value.abs());
        }

        // The reduction reads `shared` from a separate kernel, so it is computed once.
        device.reset_kernel_stats();
        let shared = x.exp().unwrap();
        let y = shared
            .exp()
            .unwrap()
            .add(&shared.log().unwrap().sum(None, true).unwrap())
            .unwrap();
        let result = y.to_host().unwrap();
        let stats = device.kernel_stats();
        assert!(stats.total_launches() >= 2);
        assert_eq!(stats.launches(Operator::Elementwise(ElementwiseOp::Exp)), 1);
        for (value, x) in result.as_slice().iter().zip(1..=4) {
            let expected = (x as f32).exp().exp() + 10.0;
            assert!((value - expected).abs() <= 1e-4 * expected);
        }
    }

    #[tokio::test]
    async fn constant_chains_launch_nothing() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let one = StridedArray::scalar(&device, 1.0);
        let two = StridedArray::new(&device, &[2.0]).unwrap();
        let three = one.add(&two).unwrap();
        let logged = three
            .reshape(&[1, 1])
            .unwrap()
            .expand(&[2, 3])
            .unwrap()
            .log()
            .unwrap();
        let total = logged.sum(None, false).unwrap();
        let maximum = logged.max(Some(1), true).unwrap();

        assert_eq!(total.to_host().unwrap().as_slice(), &[6.0 * 3f32.ln()]);
        assert_eq!(maximum.to_host().unwrap().as_slice(), &[3f32.ln(); 2]);
        assert_eq!(logged.to_host().unwrap().as_slice(), &[3f32.ln(); 6]);
        assert_eq!(logged.constant_value(), Some(3f32.ln()));
        assert_eq!(device.kernel_stats().total_launches(), 0);
    }

    #[tokio::test]
    async fn reducing_constants_never_launches() {
        let config = DeviceConfig::default().with_optimizer(OptimizerConfig::disabled());
        let Some(device) = test_device_with(config).await else {
            return;
        };
        let two = StridedArray::scalar(&device, 2.0)
            .expand(&[4, 5])
            .unwrap();
        let sum = two.sum(Some(0), false).unwrap();
        assert_eq!(sum.to_host().unwrap().as_slice(), &[8.0; 5]);
        assert_eq!(
            device.kernel_stats().launches(Operator::Reduce(ReduceOp::Sum)),
            0
        );
    }

    #[tokio::test]
    async fn view_chains_are_pruned() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::full(&device, &[2, 3], 1.0).unwrap();
        let lazy = x.exp().unwrap();
        let view = lazy
            .reshape(&[3, 2])
            .unwrap()
            .reshape(&[6])
            .unwrap()
            .reshape(&[1, 6])
            .unwrap();
        assert_eq!(view.graph_node_count(), 4);
        super::optimize(&view);
        assert_eq!(view.graph_node_count(), 2);
        let result = view.to_host().unwrap();
        assert_eq!(result.shape(), &[1, 6]);
        assert!(result.as_slice().iter().all(|v| (v - 1f32.exp()).abs() < 1e-5));
    }

    #[tokio::test]
    async fn graphviz_lists_lazy_nodes() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::full(&device, &[4], 1.0).unwrap();
        let y = x.exp().unwrap().sum(None, false).unwrap();
        let dot = y.graphviz();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("Exp"));
        assert!(dot.contains("Sum"));
        y.realize().unwrap();
        assert_eq!(y.graph_node_count(), 0);
    }

    #[tokio::test]
    async fn passes_are_transparent() {
        let mut rng = StdRng::seed_from_u64(11);
        let data: Vec<f32> = (0..96).map(|_| rng.random_range(0.1..2.0)).collect();
        let configs = [
            OptimizerConfig::minimal_kernels(),
            OptimizerConfig::disabled(),
            OptimizerConfig {
                elementwise_fusion: false,
                ..OptimizerConfig::minimal_kernels()
            },
            OptimizerConfig {
                processing_fusion: false,
                constant_folding: false,
                ..OptimizerConfig::minimal_kernels()
            },
            OptimizerConfig {
                viewop_pruning: false,
                ..OptimizerConfig::minimal_kernels()
            },
        ];
        let mut results = Vec::new();
        for optimizer in configs {
            let config = DeviceConfig::default().with_optimizer(optimizer);
            let Some(device) = test_device_with(config).await else {
                return;
            };
            let x = StridedArray::from_vec(&device, &data, &[2, 6, 8]).unwrap();
            let w = StridedArray::from_vec(&device, &data[..64], &[8, 8]).unwrap();
            let half = StridedArray::scalar(&device, 0.5);
            let two = StridedArray::scalar(&device, 2.0);
            let scale = half.mul(&two).unwrap();

            let hidden = x
                .matmul(&w)
                .unwrap()
                .mul(&scale)
                .unwrap()
                .sub(&x.max(Some(-1), true).unwrap())
                .unwrap()
                .relu()
                .unwrap();
            let normalized = hidden
                .exp()
                .unwrap()
                .div(&hidden.exp().unwrap().sum(Some(-1), true).unwrap())
                .unwrap()
                .log()
                .unwrap()
                .pow(&two)
                .unwrap();
            let result = normalized
                .permute(&[0, 2, 1])
                .unwrap()
                .reshape(&[16, -1])
                .unwrap()
                .narrow(0, 2, 8)
                .unwrap()
                .sum(Some(0), false)
                .unwrap()
                .add(&hidden.sum(None, false).unwrap())
                .unwrap();
            results.push(result.to_host().unwrap());
        }
        for result in &results[1..] {
            assert_close(result, &results[0]);
        }
    }
}
