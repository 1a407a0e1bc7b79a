/*!
 * Query router tests
 * Backend selection heuristics and decision reasons
 */

use bson::{doc, Bson};
use miragedb::router::{
    BackendKind, OperationKind, QueryRouter, ReadRequest, RouterConfig,
};

fn router_with(config: RouterConfig) -> QueryRouter {
    QueryRouter::new(config)
}

fn olap_router() -> QueryRouter {
    router_with(RouterConfig {
        olap_configured: true,
        ..RouterConfig::default()
    })
}

#[test]
fn test_route_write_is_always_oltp() {
    let decision = olap_router().route_write();
    assert_eq!(decision.backend, BackendKind::Oltp);
    assert!(!decision.reason.is_empty());
}

#[test]
fn test_analyze_id_match_pipeline() {
    let pipeline = vec![Bson::Document(doc! {"$match": {"_id": "user123"}})];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let ch = olap_router().analyze(&request);
    assert!(ch.has_id_lookup);
    assert_eq!(ch.estimated_rows, 1);
    assert!(!ch.has_heavy_aggregation);

    let decision = olap_router().route_read(&request);
    assert_eq!(decision.backend, BackendKind::Oltp);
}

#[test]
fn test_group_pipeline_is_heavy_aggregation() {
    let pipeline = vec![Bson::Document(doc! {"$group": {"_id": "$cat", "n": {"$sum": 1}}})];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let decision = olap_router().route_read(&request);
    assert_eq!(decision.backend, BackendKind::Olap);
    assert!(decision.reason.contains("Heavy aggregation"));
    assert_eq!(decision.characteristics.olap_stages, vec!["$group"]);
}

#[test]
fn test_all_heavy_stage_names_collected() {
    let pipeline = vec![
        Bson::Document(doc! {"$lookup": {"from": "x", "localField": "a", "foreignField": "b", "as": "j"}}),
        Bson::Document(doc! {"$facet": {"a": []}}),
        Bson::Document(doc! {"$bucket": {"groupBy": "$a", "boundaries": [0, 10]}}),
    ];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let ch = olap_router().analyze(&request);
    assert_eq!(ch.olap_stages, vec!["$lookup", "$facet", "$bucket"]);
}

#[test]
fn test_large_sample_is_heavy_small_sample_is_not() {
    let large = vec![Bson::Document(doc! {"$sample": {"size": 5000}})];
    let small = vec![Bson::Document(doc! {"$sample": {"size": 10}})];

    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&large),
        ..ReadRequest::default()
    };
    assert!(olap_router().analyze(&request).has_heavy_aggregation);

    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&small),
        ..ReadRequest::default()
    };
    assert!(!olap_router().analyze(&request).has_heavy_aggregation);
}

#[test]
fn test_id_in_list_estimates_rows() {
    let filter = doc! {"_id": {"$in": [1, 2, 3]}};
    let request = ReadRequest {
        kind: Some(OperationKind::Find),
        filter: Some(&filter),
        ..ReadRequest::default()
    };
    let ch = olap_router().analyze(&request);
    assert!(ch.has_id_lookup);
    assert_eq!(ch.estimated_rows, 3);
}

#[test]
fn test_large_in_list_is_not_point_lookup() {
    let ids: Vec<Bson> = (0..150).map(Bson::Int32).collect();
    let filter = doc! {"_id": {"$in": ids}};
    let request = ReadRequest {
        kind: Some(OperationKind::Find),
        filter: Some(&filter),
        ..ReadRequest::default()
    };
    assert!(!olap_router().analyze(&request).has_id_lookup);
}

#[test]
fn test_time_range_predicate_routes_olap() {
    let filter = doc! {"_cdc_timestamp": {"$gt": 1_700_000_000_i64}};
    let request = ReadRequest {
        kind: Some(OperationKind::Find),
        filter: Some(&filter),
        limit: Some(5),
        ..ReadRequest::default()
    };
    let decision = olap_router().route_read(&request);
    assert_eq!(decision.backend, BackendKind::Olap);
    assert!(decision.characteristics.is_time_range_query);
}

#[test]
fn test_pipeline_limit_bounds_estimate() {
    let pipeline = vec![
        Bson::Document(doc! {"$match": {"status": "open"}}),
        Bson::Document(doc! {"$limit": 25}),
    ];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let decision = olap_router().route_read(&request);
    assert_eq!(decision.characteristics.estimated_rows, 25);
    assert_eq!(decision.backend, BackendKind::Oltp);
}

#[test]
fn test_unbounded_scan_routes_olap_when_available() {
    let filter = doc! {"status": "open"};
    let request = ReadRequest {
        kind: Some(OperationKind::Find),
        filter: Some(&filter),
        ..ReadRequest::default()
    };
    assert_eq!(olap_router().route_read(&request).backend, BackendKind::Olap);

    // Same scan with no OLAP configured falls back with a reason.
    let fallback = router_with(RouterConfig::default()).route_read(&request);
    assert_eq!(fallback.backend, BackendKind::Oltp);
    assert!(fallback.reason.contains("OLAP not configured"));
}

#[test]
fn test_auto_routing_disabled_pins_oltp() {
    let pipeline = vec![Bson::Document(doc! {"$group": {"_id": null}})];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let decision = router_with(RouterConfig {
        auto_routing: false,
        olap_configured: true,
        ..RouterConfig::default()
    })
    .route_read(&request);
    assert_eq!(decision.backend, BackendKind::Oltp);
    assert!(decision.reason.contains("Auto-routing disabled"));
}

#[test]
fn test_explicit_hint_beats_heuristics() {
    let filter = doc! {"_id": 7};
    let request = ReadRequest {
        kind: Some(OperationKind::Find),
        filter: Some(&filter),
        backend_hint: Some(BackendKind::Olap),
        ..ReadRequest::default()
    };
    let decision = olap_router().route_read(&request);
    assert_eq!(decision.backend, BackendKind::Olap);
    assert!(decision.reason.contains("override"));
}

#[test]
fn test_prefer_olap_for_aggregations_flag() {
    let pipeline = vec![Bson::Document(doc! {"$match": {"a": 1}}), Bson::Document(doc! {"$limit": 3})];
    let request = ReadRequest {
        kind: Some(OperationKind::Aggregate),
        pipeline: Some(&pipeline),
        ..ReadRequest::default()
    };
    let decision = router_with(RouterConfig {
        olap_configured: true,
        prefer_olap_for_aggregations: true,
        ..RouterConfig::default()
    })
    .route_read(&request);
    assert_eq!(decision.backend, BackendKind::Olap);
}
