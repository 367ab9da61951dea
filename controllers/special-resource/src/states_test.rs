#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use helmer::MockHelmer;
    use serde_json::json;

    use crate::error::{ControllerError, StatusUpdateError};
    use crate::kernel::{ClusterKernelMap, cluster_kernel_map};
    use crate::queue::ResourceKey;
    use crate::render::PLATFORM_OPENSHIFT;
    use crate::states::{StateEngine, state_label};
    use crate::status::ClusterStatusUpdater;
    use crate::test_utils::{
        KERNEL_AFFINE_TEMPLATE, MockClusterClient, PLAIN_TEMPLATE, RecordingMetrics, create_test_chart,
        create_test_node, create_test_special_resource,
    };

    const KERNEL_A: &str = "4.18.0-305.el8.x86_64";
    const KERNEL_B: &str = "4.18.0-348.el8.x86_64";
    const KERNEL_C: &str = "4.18.0-372.el8.x86_64";

    struct Fixture {
        cluster: Arc<MockClusterClient>,
        helmer: Arc<MockHelmer>,
        metrics: Arc<RecordingMetrics>,
        engine: StateEngine,
    }

    fn fixture(kernels: &[&str]) -> (Fixture, ClusterKernelMap) {
        let cluster = Arc::new(MockClusterClient::new());
        cluster.add_special_resource(create_test_special_resource("simple-kmod"));
        for (i, kernel) in kernels.iter().enumerate() {
            cluster.add_node(create_test_node(&format!("worker-{}", i), kernel, "rhcos", "4.10", Some("8.4")));
        }
        let nodes: Vec<_> = kernels
            .iter()
            .enumerate()
            .map(|(i, kernel)| create_test_node(&format!("worker-{}", i), kernel, "rhcos", "4.10", Some("8.4")))
            .collect();
        let kernel_map = cluster_kernel_map(&nodes, "registry/dtk:latest");

        let helmer = Arc::new(MockHelmer::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let status = Arc::new(ClusterStatusUpdater::new(cluster.clone()));
        let engine = StateEngine::new(helmer.clone(), status, metrics.clone(), cluster.clone());
        (
            Fixture {
                cluster,
                helmer,
                metrics,
                engine,
            },
            kernel_map,
        )
    }

    #[tokio::test]
    async fn test_states_run_in_ordinal_order() {
        let (f, kernels) = fixture(&[KERNEL_A]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[
            ("templates/0002-driver.yaml", PLAIN_TEMPLATE),
            ("templates/0001-namespace.yaml", PLAIN_TEMPLATE),
        ]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let calls = f.helmer.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].templates, vec!["templates/0001-namespace.yaml"]);
        assert_eq!(calls[1].templates, vec!["templates/0002-driver.yaml"]);
        assert!(calls[2].templates.is_empty());
        assert_eq!(calls[0].values["stateName"], "simple-kmod-0001");
        assert_eq!(calls[1].values["stateName"], "simple-kmod-0002");
    }

    #[tokio::test]
    async fn test_named_templates_accompany_every_apply() {
        let (f, kernels) = fixture(&[KERNEL_A]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[
            ("templates/0001-ns.yaml", PLAIN_TEMPLATE),
            ("templates/helpers.tpl", "{{- define \"name\" -}}x{{- end -}}"),
            ("templates/cfg.yaml", PLAIN_TEMPLATE),
        ]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let calls = f.helmer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].templates, vec!["templates/helpers.tpl", "templates/0001-ns.yaml"]);
        assert_eq!(calls[1].templates, vec!["templates/helpers.tpl", "templates/cfg.yaml"]);
        assert_eq!(calls[0].kernel_full_version, KERNEL_A);
        assert_eq!(calls[0].operating_system_decimal, "8.4");
        // The stateless pass never renders in debug mode
        assert!(!calls[1].debug);
    }

    #[tokio::test]
    async fn test_values_layering() {
        let (f, kernels) = fixture(&[KERNEL_A]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let values = &f.helmer.calls()[0].values;
        assert_eq!(values["kmodNames"], json!(["simple-kmod"]));
        assert_eq!(values["kernelFullVersion"], KERNEL_A);
        assert_eq!(values["operatingSystemMajor"], "rhel8");
        assert_eq!(values["clusterVersionMajorMinor"], "4.10");
        assert_eq!(values["platform"], "OCP");
    }

    #[tokio::test]
    async fn test_non_affine_state_applies_once() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B, KERNEL_C]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let state_calls: Vec<_> = f
            .helmer
            .calls()
            .into_iter()
            .filter(|c| c.templates.contains(&"templates/0001-ns.yaml".to_string()))
            .collect();
        assert_eq!(state_calls.len(), 1);
        assert_eq!(state_calls[0].kernel_full_version, KERNEL_A);
    }

    #[tokio::test]
    async fn test_non_affine_failure_still_applies_once() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B]);
        f.helmer.fail_kernel(KERNEL_A);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        // The stateless pass renders for the same kernel and fails too
        let err = f
            .engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Helmer(_)));

        let state_calls: Vec<_> = f
            .helmer
            .calls()
            .into_iter()
            .filter(|c| c.templates.contains(&"templates/0001-ns.yaml".to_string()))
            .collect();
        assert_eq!(state_calls.len(), 1);
        assert_eq!(state_calls[0].kernel_full_version, KERNEL_A);
        assert_eq!(
            f.metrics.values(),
            vec![("simple-kmod".to_string(), "templates/0001-ns.yaml".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_failed_progress_update_stops_before_apply() {
        let (f, kernels) = fixture(&[KERNEL_A]);
        f.cluster.remove_special_resource("simple-kmod");
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        let err = f
            .engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::StatusUpdate(StatusUpdateError::NotFound(_))));
        assert!(f.helmer.calls().is_empty());
        assert!(f.metrics.values().is_empty());
    }

    #[tokio::test]
    async fn test_affine_state_fans_out_per_kernel() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-driver.yaml", KERNEL_AFFINE_TEMPLATE)]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let calls = f.helmer.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].kernel_full_version, KERNEL_A);
        assert_eq!(calls[1].kernel_full_version, KERNEL_B);
        // Stateless pass reuses the last render context
        assert_eq!(calls[2].kernel_full_version, KERNEL_B);
        assert_eq!(
            f.metrics.values(),
            vec![("simple-kmod".to_string(), "templates/0001-driver.yaml".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_affine_failure_before_last_kernel_continues() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B, KERNEL_C]);
        f.helmer.fail_kernel(KERNEL_B);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-driver.yaml", KERNEL_AFFINE_TEMPLATE)]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let kernels_applied: Vec<_> = f.helmer.calls().iter().map(|c| c.kernel_full_version.clone()).collect();
        assert_eq!(kernels_applied, vec![KERNEL_A, KERNEL_B, KERNEL_C, KERNEL_C]);
        assert_eq!(f.metrics.values()[0].2, 1);
    }

    #[tokio::test]
    async fn test_affine_failure_on_last_kernel_fails_state() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B]);
        f.helmer.fail_kernel(KERNEL_B);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[
            ("templates/0001-driver.yaml", KERNEL_AFFINE_TEMPLATE),
            ("templates/0002-plugin.yaml", PLAIN_TEMPLATE),
        ]);

        let err = f
            .engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();

        match err {
            ControllerError::StateFailed { state, .. } => assert_eq!(state, "templates/0001-driver.yaml"),
            other => panic!("unexpected error: {}", other),
        }
        // Later states never run
        assert_eq!(f.helmer.calls().len(), 2);
        assert_eq!(
            f.metrics.values(),
            vec![("simple-kmod".to_string(), "templates/0001-driver.yaml".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_empty_kernel_map_is_an_error() {
        let (f, _) = fixture(&[]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        let err = f
            .engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &ClusterKernelMap::new(), PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NoKernelVersion));
        assert!(f.helmer.calls().is_empty());

        // Charts without states still need a render context
        let stateless = create_test_chart(&[("templates/cfg.yaml", PLAIN_TEMPLATE)]);
        let err = f
            .engine
            .reconcile_states(&sr, &stateless, &sr.spec.set, &ClusterKernelMap::new(), PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NoKernelVersion));
    }

    #[tokio::test]
    async fn test_completed_states_label_nodes_and_report_progress() {
        let (f, kernels) = fixture(&[KERNEL_A, KERNEL_B]);
        let sr = create_test_special_resource("simple-kmod");
        let chart = create_test_chart(&[("templates/0001-ns.yaml", PLAIN_TEMPLATE)]);

        f.engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap();

        let label = state_label("simple-kmod-0001");
        for node in ["worker-0", "worker-1"] {
            assert_eq!(f.cluster.node_labels(node).get(&label).map(String::as_str), Some("Ready"));
        }

        let written = f.cluster.special_resource(&ResourceKey::cluster("simple-kmod")).unwrap();
        let state = written.condition_state().unwrap();
        assert_eq!(state.reason, "HandlingState");
        assert_eq!(state.message, "Working on: templates/0001-ns.yaml");
    }

    #[tokio::test]
    async fn test_resource_without_uid_is_rejected() {
        let (f, kernels) = fixture(&[KERNEL_A]);
        let mut sr = create_test_special_resource("simple-kmod");
        sr.metadata.uid = None;
        let chart = create_test_chart(&[("templates/cfg.yaml", PLAIN_TEMPLATE)]);

        let err = f
            .engine
            .reconcile_states(&sr, &chart, &sr.spec.set, &kernels, PLATFORM_OPENSHIFT)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidResource(_)));
    }
}
