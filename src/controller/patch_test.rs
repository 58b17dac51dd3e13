//! Tests for the incremental patch engine

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use serde_json::Value;

    use crate::controller::cluster_spec::{build_desired_cluster, HA_INSTANCES};
    use crate::controller::networking::for_strategy;
    use crate::controller::patch::{diff, to_merge_patch, SpecChange, Transition};
    use crate::controller::topology::Topology;
    use crate::crd::{
        Cluster, ClusterReplication, CrossCloudNetworkingStrategy, DocumentDB, DocumentDBSpec,
        MemberCluster,
    };
    use crate::error::{Error, CONFIG_REQUEUE};

    fn documentdb(
        members: &[&str],
        primary: &str,
        ha: bool,
        strategy: CrossCloudNetworkingStrategy,
    ) -> DocumentDB {
        DocumentDB {
            metadata: ObjectMeta {
                name: Some("db".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            spec: DocumentDBSpec {
                node_count: 1,
                instances_per_node: 1,
                cluster_replication: Some(ClusterReplication {
                    primary: primary.to_string(),
                    cluster_list: members
                        .iter()
                        .map(|m| MemberCluster {
                            name: m.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                    high_availability: ha,
                    cross_cloud_networking_strategy: strategy,
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn cluster_for(doc: &DocumentDB, me: &str, existing: Option<&Cluster>) -> Cluster {
        let topology = Topology::resolve(doc, Some(me)).unwrap();
        build_desired_cluster(doc, &topology, for_strategy(topology.strategy).as_ref(), existing)
    }

    fn none(members: &[&str], primary: &str, ha: bool) -> DocumentDB {
        documentdb(members, primary, ha, CrossCloudNetworkingStrategy::None)
    }

    fn has(changes: &[SpecChange], pred: impl Fn(&SpecChange) -> bool) -> bool {
        changes.iter().any(pred)
    }

    #[test]
    fn test_diff_against_itself_is_empty() {
        for ha in [false, true] {
            for me in ["a", "b"] {
                let cluster = cluster_for(&none(&["a", "b"], "a", ha), me, None);
                let plan = diff(&cluster, &cluster).unwrap();
                assert!(plan.is_empty());
                assert_eq!(plan.transition, Transition::None);
                assert!(!plan.peers_changed);
            }
        }
    }

    #[test]
    fn test_self_change_is_terminal() {
        let current = cluster_for(&none(&["a", "b"], "a", false), "a", None);
        let mut desired = current.clone();
        if let Some(replica) = desired.spec.replica_cluster.as_mut() {
            replica.self_name = "db-other".to_string();
        }

        let err = diff(&current, &desired).unwrap_err();
        assert!(matches!(err, Error::ImmutableField { .. }));
        assert!(err.is_config_error());
        assert_eq!(err.requeue_after(), CONFIG_REQUEUE);
    }

    #[test]
    fn test_ha_demotion_drops_synchronous_block() {
        let current = cluster_for(&none(&["a", "b"], "a", true), "a", None);
        let desired = cluster_for(&none(&["a", "b"], "b", true), "a", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::Demotion);
        assert!(matches!(plan.changes[0], SpecChange::ReplicaCluster(ref r) if !r.is_primary()));
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::RemoveSynchronous)));
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::Instances(1))));
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::Plugins(p) if p.len() == 1)));

        let patch = to_merge_patch(&plan.changes).unwrap();
        assert_eq!(patch["spec"]["postgresql"]["synchronous"], Value::Null);
        assert!(patch["spec"]["postgresql"]
            .as_object()
            .unwrap()
            .contains_key("synchronous"));
    }

    #[test]
    fn test_demotion_without_synchronous_block_does_not_remove_it() {
        let mut current = cluster_for(&none(&["a", "b"], "a", true), "a", None);
        current.spec.postgresql = None;
        let desired = cluster_for(&none(&["a", "b"], "b", true), "a", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::Demotion);
        assert!(!has(&plan.changes, |c| matches!(c, SpecChange::RemoveSynchronous)));

        let patch = to_merge_patch(&plan.changes).unwrap();
        assert!(patch["spec"].get("postgresql").is_none());
    }

    #[test]
    fn test_demotion_clears_stale_promotion_token() {
        let mut current = cluster_for(&none(&["a", "b"], "a", false), "a", None);
        if let Some(replica) = current.spec.replica_cluster.as_mut() {
            replica.promotion_token = Some("old-token".to_string());
        }
        let desired = cluster_for(&none(&["a", "b"], "b", false), "a", Some(&current));

        let patch = to_merge_patch(&diff(&current, &desired).unwrap().changes).unwrap();
        let replica = patch["spec"]["replica"].as_object().unwrap();
        assert_eq!(replica.get("promotionToken"), Some(&Value::Null));
    }

    #[test]
    fn test_ha_promotion_restores_primary_layout() {
        let current = cluster_for(&none(&["a", "b"], "a", true), "b", None);
        let desired = cluster_for(&none(&["a", "b"], "b", true), "b", Some(&current));

        let mut plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::Promotion);
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::Postgresql(_))));
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::Instances(n) if *n == HA_INSTANCES)));
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::ReplicationSlots(Some(_)))));

        plan.set_promotion_token("token-123");
        let patch = to_merge_patch(&plan.changes).unwrap();
        assert_eq!(patch["spec"]["replica"]["promotionToken"], "token-123");
        assert_eq!(patch["spec"]["replica"]["primary"], patch["spec"]["replica"]["self"]);
        assert_eq!(patch["spec"]["postgresql"]["synchronous"]["method"], "any");
        assert_eq!(patch["spec"]["instances"], HA_INSTANCES);
    }

    #[test]
    fn test_promotion_without_ha_only_flips_replica() {
        let current = cluster_for(&none(&["a", "b"], "a", false), "b", None);
        let desired = cluster_for(&none(&["a", "b"], "b", false), "b", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::Promotion);
        assert_eq!(plan.changes.len(), 1);
        assert!(matches!(plan.changes[0], SpecChange::ReplicaCluster(_)));
    }

    #[test]
    fn test_replica_peer_change_replaces_external_clusters_only() {
        let current = cluster_for(&none(&["a", "b"], "a", false), "b", None);
        let desired = cluster_for(&none(&["a", "b", "c"], "a", false), "b", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::None);
        assert!(plan.peers_changed);
        assert_eq!(plan.changes.len(), 1);
        match &plan.changes[0] {
            SpecChange::ExternalClusters(clusters) => assert_eq!(clusters.len(), 3),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_replica_source_change_is_replica_update() {
        let current = cluster_for(&none(&["a", "b", "c"], "a", false), "c", None);
        let desired = cluster_for(&none(&["a", "b", "c"], "b", false), "c", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::ReplicaUpdate);
        assert!(matches!(plan.changes[0], SpecChange::ReplicaCluster(_)));
        assert!(!plan.peers_changed);
    }

    #[test]
    fn test_ha_primary_peer_change_updates_synchronous_standbys() {
        let current = cluster_for(&none(&["a", "b"], "a", true), "a", None);
        let desired = cluster_for(&none(&["a", "b", "c"], "a", true), "a", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::None);
        let sync = plan.changes.iter().find_map(|c| match c {
            SpecChange::Synchronous(s) => Some(s),
            _ => None,
        });
        assert_eq!(sync.map(|s| s.standby_names_post.len()), Some(2));
    }

    #[test]
    fn test_fleet_peer_change_updates_managed_services() {
        let fleet = |members: &[&str]| {
            documentdb(members, "a", false, CrossCloudNetworkingStrategy::AzureFleet)
        };
        let current = cluster_for(&fleet(&["a", "b", "c"]), "a", None);
        let desired = cluster_for(&fleet(&["a", "b"]), "a", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::ManagedServices(s) if s.len() == 1)));

        let patch = to_merge_patch(&plan.changes).unwrap();
        assert_eq!(
            patch["spec"]["managed"]["services"]["additional"]
                .as_array()
                .map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_last_member_standing_drops_replica_stanza() {
        let current = cluster_for(&none(&["a", "b"], "a", false), "b", None);
        let desired = cluster_for(&none(&["b"], "b", false), "b", Some(&current));

        let plan = diff(&current, &desired).unwrap();
        assert_eq!(plan.transition, Transition::Promotion);
        assert!(has(&plan.changes, |c| matches!(c, SpecChange::RemoveReplicaCluster)));

        let patch = to_merge_patch(&plan.changes).unwrap();
        assert_eq!(patch["spec"]["replica"], Value::Null);
        assert_eq!(patch["spec"]["externalClusters"], Value::Array(vec![]));
    }
}
