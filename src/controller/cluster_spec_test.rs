//! Tests for engine cluster synthesis

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    use crate::controller::cluster_spec::{
        build_desired_cluster, HA_INSTANCES, ROLE_LABEL, SIDECAR_PLUGIN, WAL_REPLICA_PLUGIN,
        WAL_REPLICA_SLOT,
    };
    use crate::controller::naming::engine_cluster_name;
    use crate::controller::networking::{for_strategy, FleetNetworking, NoNetworking, PeerNetworking};
    use crate::controller::topology::Topology;
    use crate::crd::{
        BootstrapConfig, Cluster, ClusterReplication, CrossCloudNetworkingStrategy, DocumentDB,
        DocumentDBSpec, MemberCluster, RecoveryConfig,
    };

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
                uid: Some("uid-db".to_string()),
                ..Default::default()
            },
            spec: DocumentDBSpec {
                node_count: 1,
                instances_per_node: 2,
                postgres_image: "ghcr.io/documentdb/postgres:16".to_string(),
                gateway_image: "ghcr.io/documentdb/gateway:0.1".to_string(),
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

    fn desired(doc: &DocumentDB, me: &str, existing: Option<&Cluster>) -> Cluster {
        let topology = Topology::resolve(doc, Some(me)).unwrap();
        let networking = for_strategy(topology.strategy);
        build_desired_cluster(doc, &topology, networking.as_ref(), existing)
    }

    #[test]
    fn test_primary_without_ha_has_no_synchronous_block() {
        let doc = documentdb(&["a", "b"], "a", false, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "a", None);

        assert_eq!(cluster.name_any(), engine_cluster_name("db", "a"));
        assert_eq!(cluster.spec.instances, 2);
        assert!(cluster.spec.postgresql.is_none());
        assert!(cluster.spec.replication_slots.is_none());

        let replica = cluster.spec.replica_cluster.unwrap();
        assert!(replica.is_primary());
        assert_eq!(replica.source, replica.primary);
        assert_eq!(
            cluster.metadata.labels.unwrap().get(ROLE_LABEL).map(String::as_str),
            Some("primary")
        );
    }

    #[test]
    fn test_ha_primary_layout() {
        let doc = documentdb(&["a", "b", "c"], "a", true, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "a", None);

        assert_eq!(cluster.spec.instances, HA_INSTANCES);

        let sync = cluster
            .spec
            .postgresql
            .as_ref()
            .and_then(|p| p.synchronous.as_ref())
            .unwrap();
        assert_eq!(sync.method, "any");
        assert_eq!(sync.number, 1);
        assert_eq!(
            sync.standby_names_post,
            vec![engine_cluster_name("db", "b"), engine_cluster_name("db", "c")]
        );

        let slots = cluster.spec.replication_slots.as_ref().unwrap();
        assert_eq!(slots.high_availability.as_ref().map(|h| h.enabled), Some(true));

        let plugins: Vec<&str> = cluster.spec.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(plugins, vec![SIDECAR_PLUGIN, WAL_REPLICA_PLUGIN]);

        let initdb = cluster.spec.bootstrap.unwrap().initdb.unwrap();
        assert!(initdb.post_init_sql.iter().any(|s| s.contains(WAL_REPLICA_SLOT)));
    }

    #[test]
    fn test_ha_primary_restoring_from_backup_skips_slot_sql() {
        let mut doc = documentdb(&["a", "b"], "a", true, CrossCloudNetworkingStrategy::None);
        doc.spec.bootstrap = Some(BootstrapConfig {
            recovery: Some(RecoveryConfig {
                backup_name: "nightly".to_string(),
            }),
        });
        let bootstrap = desired(&doc, "a", None).spec.bootstrap.unwrap();

        assert!(bootstrap.initdb.is_none());
        assert_eq!(bootstrap.recovery.unwrap().backup.name, "nightly");
    }

    #[test]
    fn test_replica_bootstraps_from_primary() {
        let doc = documentdb(&["a", "b"], "a", true, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "b", None);

        assert_eq!(cluster.spec.instances, 2);
        assert!(cluster.spec.postgresql.is_none());
        let basebackup = cluster.spec.bootstrap.unwrap().pg_basebackup.unwrap();
        assert_eq!(basebackup.source, engine_cluster_name("db", "a"));

        let replica = cluster.spec.replica_cluster.unwrap();
        assert!(!replica.is_primary());
        assert_eq!(replica.self_name, engine_cluster_name("db", "b"));
        assert_eq!(
            cluster.metadata.labels.unwrap().get(ROLE_LABEL).map(String::as_str),
            Some("replica")
        );
    }

    #[test]
    fn test_existing_bootstrap_is_carried_over() {
        let doc = documentdb(&["a", "b"], "a", false, CrossCloudNetworkingStrategy::None);
        let existing = desired(&doc, "a", None);

        // a later pass on the now-replica must not switch to pg_basebackup
        let mut failed_over = doc.clone();
        if let Some(rep) = failed_over.spec.cluster_replication.as_mut() {
            rep.primary = "b".to_string();
        }
        let cluster = desired(&failed_over, "a", Some(&existing));
        assert_eq!(cluster.spec.bootstrap, existing.spec.bootstrap);
    }

    #[test]
    fn test_external_clusters_self_first_then_peers() {
        let doc = documentdb(&["a", "b", "c"], "a", false, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "b", None);

        let names: Vec<&str> = cluster
            .spec
            .external_clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let expected = [
            engine_cluster_name("db", "b"),
            engine_cluster_name("db", "a"),
            engine_cluster_name("db", "c"),
        ];
        assert_eq!(names, expected.iter().map(String::as_str).collect::<Vec<_>>());

        let self_host = &cluster.spec.external_clusters[0].connection_parameters["host"];
        assert_eq!(self_host, &format!("{}-rw.prod.svc", expected[0]));
    }

    #[test]
    fn test_fleet_adds_managed_services_and_fleet_hosts() {
        let doc = documentdb(&["a", "b", "c"], "a", false, CrossCloudNetworkingStrategy::AzureFleet);
        let topology = Topology::resolve(&doc, Some("a")).unwrap();
        let cluster = build_desired_cluster(&doc, &topology, &FleetNetworking, None);

        let additional = &cluster.spec.managed.as_ref().unwrap().services.as_ref().unwrap().additional;
        assert_eq!(additional.len(), 2);
        assert!(additional.iter().all(|s| s.selector_type == "rw"));

        for peer in &cluster.spec.external_clusters[1..] {
            assert!(peer.connection_parameters["host"].ends_with(".fleet-system.svc"));
        }
    }

    #[test]
    fn test_non_fleet_has_no_managed_services() {
        let doc = documentdb(&["a", "b"], "a", false, CrossCloudNetworkingStrategy::None);
        let topology = Topology::resolve(&doc, Some("a")).unwrap();
        let cluster = build_desired_cluster(&doc, &topology, &NoNetworking, None);
        assert!(cluster.spec.managed.is_none());
        assert_eq!(NoNetworking.strategy(), CrossCloudNetworkingStrategy::None);
    }

    #[test]
    fn test_standalone_has_no_replica_stanza() {
        let mut doc = documentdb(&["a"], "a", false, CrossCloudNetworkingStrategy::None);
        doc.spec.cluster_replication = None;
        let topology = Topology::resolve(&doc, None).unwrap();
        let cluster = build_desired_cluster(&doc, &topology, &NoNetworking, None);

        assert_eq!(cluster.name_any(), "db");
        assert!(cluster.spec.replica_cluster.is_none());
        assert!(cluster.spec.external_clusters.is_empty());
        assert!(!cluster.metadata.labels.unwrap().contains_key(ROLE_LABEL));
    }

    #[test]
    fn test_gateway_image_passed_to_sidecar_plugin() {
        let doc = documentdb(&["a", "b"], "a", false, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "b", None);
        let sidecar = cluster
            .spec
            .plugins
            .iter()
            .find(|p| p.name == SIDECAR_PLUGIN)
            .unwrap();
        assert_eq!(
            sidecar.parameters.get("gatewayImage").map(String::as_str),
            Some("ghcr.io/documentdb/gateway:0.1")
        );
        assert_eq!(
            cluster.spec.image_name.as_deref(),
            Some("ghcr.io/documentdb/postgres:16")
        );
    }

    #[test]
    fn test_owned_by_documentdb() {
        let doc = documentdb(&["a", "b"], "a", false, CrossCloudNetworkingStrategy::None);
        let cluster = desired(&doc, "a", None);
        let owners = cluster.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-db");
    }
}
