/*!
 * Query router for MirageDB
 * Chooses the OLTP or OLAP backend per read operation
 */

use bson::{Array, Bson, Document};

/// Large full-collection scans default to this estimate when nothing
/// bounds the result set.
const SCAN_ESTIMATE: i64 = 10_001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Oltp,
    Olap,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Oltp => write!(f, "oltp"),
            BackendKind::Olap => write!(f, "olap"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Find,
    Aggregate,
    Count,
    Distinct,
}

/// What the analyzer learned about a read operation.
#[derive(Debug, Clone, Default)]
pub struct QueryCharacteristics {
    pub has_heavy_aggregation: bool,
    pub olap_stages: Vec<String>,
    pub has_id_lookup: bool,
    pub is_time_range_query: bool,
    pub estimated_rows: i64,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub backend: BackendKind,
    pub reason: String,
    pub characteristics: QueryCharacteristics,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub auto_routing: bool,
    pub olap_configured: bool,
    pub row_threshold: i64,
    pub large_sample_threshold: i64,
    pub prefer_olap_for_aggregations: bool,
    pub timestamp_fields: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            auto_routing: true,
            olap_configured: false,
            row_threshold: 10_000,
            large_sample_threshold: 1_000,
            prefer_olap_for_aggregations: false,
            timestamp_fields: vec![
                "created_at".to_string(),
                "updated_at".to_string(),
                "timestamp".to_string(),
                "_cdc_timestamp".to_string(),
            ],
        }
    }
}

/// A read operation as the router sees it.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest<'a> {
    pub kind: Option<OperationKind>,
    pub filter: Option<&'a Document>,
    pub pipeline: Option<&'a Array>,
    pub limit: Option<i64>,
    pub backend_hint: Option<BackendKind>,
}

/// Stage names that mark a pipeline as heavy aggregation work.
const HEAVY_STAGES: [&str; 6] = [
    "$group",
    "$bucket",
    "$bucketAuto",
    "$facet",
    "$lookup",
    "$graphLookup",
];

pub struct QueryRouter {
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Writes, metadata and cursor lifecycle always run on OLTP.
    pub fn route_write(&self) -> RouteDecision {
        RouteDecision {
            backend: BackendKind::Oltp,
            reason: "Writes and metadata operations always use OLTP".to_string(),
            characteristics: QueryCharacteristics::default(),
        }
    }

    /// Inspect a read without deciding anything.
    pub fn analyze(&self, request: &ReadRequest<'_>) -> QueryCharacteristics {
        let mut ch = QueryCharacteristics::default();

        if let Some(pipeline) = request.pipeline {
            for stage_value in pipeline.iter() {
                let stage = match stage_value.as_document() {
                    Some(stage) if stage.len() == 1 => stage,
                    _ => continue,
                };
                let (name, arg) = stage.iter().next().expect("len checked");
                if HEAVY_STAGES.contains(&name.as_str()) {
                    ch.olap_stages.push(name.clone());
                } else if name == "$sample" {
                    let size = arg
                        .as_document()
                        .and_then(|d| d.get("size"))
                        .and_then(numeric)
                        .unwrap_or(0);
                    if size >= self.config.large_sample_threshold {
                        ch.olap_stages.push(name.clone());
                    }
                } else if name == "$match" {
                    if let Some(filter) = arg.as_document() {
                        self.inspect_filter(filter, &mut ch);
                    }
                }
            }
            ch.has_heavy_aggregation = !ch.olap_stages.is_empty();
        }

        if let Some(filter) = request.filter {
            self.inspect_filter(filter, &mut ch);
        }

        ch.estimated_rows = if ch.has_id_lookup {
            ch.estimated_rows.max(1)
        } else if let Some(limit) = pipeline_limit(request.pipeline).or(request.limit) {
            limit
        } else {
            SCAN_ESTIMATE
        };

        ch
    }

    /// Pick a backend for a read. Every decision carries a reason string.
    pub fn route_read(&self, request: &ReadRequest<'_>) -> RouteDecision {
        let characteristics = self.analyze(request);

        if let Some(hint) = request.backend_hint {
            if hint == BackendKind::Olap && !self.config.olap_configured {
                return RouteDecision {
                    backend: BackendKind::Oltp,
                    reason: "Explicit OLAP override, but OLAP is not configured; using OLTP"
                        .to_string(),
                    characteristics,
                };
            }
            return RouteDecision {
                backend: hint,
                reason: format!("Explicit backend override: {}", hint),
                characteristics,
            };
        }

        if !self.config.auto_routing {
            return RouteDecision {
                backend: BackendKind::Oltp,
                reason: "Auto-routing disabled".to_string(),
                characteristics,
            };
        }

        if characteristics.has_heavy_aggregation {
            return self.olap_or_fallback(
                format!(
                    "Heavy aggregation stages: {}",
                    characteristics.olap_stages.join(", ")
                ),
                characteristics,
            );
        }

        if characteristics.has_id_lookup {
            return RouteDecision {
                backend: BackendKind::Oltp,
                reason: format!(
                    "Point lookup on _id (estimated {} rows)",
                    characteristics.estimated_rows
                ),
                characteristics,
            };
        }

        if characteristics.is_time_range_query {
            return self.olap_or_fallback(
                "Time-range predicate on a timestamp field".to_string(),
                characteristics,
            );
        }

        if characteristics.estimated_rows >= self.config.row_threshold {
            return self.olap_or_fallback(
                format!(
                    "Estimated {} rows exceeds threshold {}",
                    characteristics.estimated_rows, self.config.row_threshold
                ),
                characteristics,
            );
        }

        if self.config.prefer_olap_for_aggregations
            && request.kind == Some(OperationKind::Aggregate)
        {
            return self.olap_or_fallback(
                "preferOlapForAggregations is set".to_string(),
                characteristics,
            );
        }

        RouteDecision {
            backend: BackendKind::Oltp,
            reason: "Default OLTP routing".to_string(),
            characteristics,
        }
    }

    fn olap_or_fallback(
        &self,
        reason: String,
        characteristics: QueryCharacteristics,
    ) -> RouteDecision {
        if self.config.olap_configured {
            RouteDecision {
                backend: BackendKind::Olap,
                reason,
                characteristics,
            }
        } else {
            RouteDecision {
                backend: BackendKind::Oltp,
                reason: format!("{} (OLAP not configured; using OLTP)", reason),
                characteristics,
            }
        }
    }

    fn inspect_filter(&self, filter: &Document, ch: &mut QueryCharacteristics) {
        for (key, value) in filter {
            if key == "_id" {
                match value {
                    Bson::Document(ops) => {
                        if ops.contains_key("$eq") {
                            ch.has_id_lookup = true;
                            ch.estimated_rows = ch.estimated_rows.max(1);
                        } else if let Some(Bson::Array(values)) = ops.get("$in") {
                            if values.len() <= 100 {
                                ch.has_id_lookup = true;
                                ch.estimated_rows =
                                    ch.estimated_rows.max(values.len() as i64);
                            }
                        }
                    }
                    _ => {
                        ch.has_id_lookup = true;
                        ch.estimated_rows = ch.estimated_rows.max(1);
                    }
                }
            } else if self.config.timestamp_fields.iter().any(|f| f == key) {
                if let Bson::Document(ops) = value {
                    if ["$gt", "$gte", "$lt", "$lte"]
                        .iter()
                        .any(|op| ops.contains_key(*op))
                    {
                        ch.is_time_range_query = true;
                    }
                }
            } else if matches!(key.as_str(), "$and" | "$or" | "$nor") {
                if let Bson::Array(sub_filters) = value {
                    for sub in sub_filters {
                        if let Some(sub_doc) = sub.as_document() {
                            self.inspect_filter(sub_doc, ch);
                        }
                    }
                }
            }
        }
    }
}

fn numeric(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) => Some(*d as i64),
        _ => None,
    }
}

fn pipeline_limit(pipeline: Option<&Array>) -> Option<i64> {
    pipeline?.iter().find_map(|stage| {
        stage
            .as_document()
            .and_then(|d| d.get("$limit"))
            .and_then(numeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn router(olap: bool) -> QueryRouter {
        QueryRouter::new(RouterConfig {
            olap_configured: olap,
            ..RouterConfig::default()
        })
    }

    #[test]
    fn test_writes_always_oltp() {
        assert_eq!(router(true).route_write().backend, BackendKind::Oltp);
    }

    #[test]
    fn test_id_point_lookup_routes_oltp() {
        let pipeline = vec![Bson::Document(doc! {"$match": {"_id": "user123"}})];
        let request = ReadRequest {
            kind: Some(OperationKind::Aggregate),
            pipeline: Some(&pipeline),
            ..ReadRequest::default()
        };
        let r = router(true);
        let ch = r.analyze(&request);
        assert!(ch.has_id_lookup);
        assert_eq!(ch.estimated_rows, 1);
        assert_eq!(r.route_read(&request).backend, BackendKind::Oltp);
    }

    #[test]
    fn test_heavy_aggregation_routes_olap() {
        let pipeline = vec![Bson::Document(
            doc! {"$group": {"_id": "$cat", "n": {"$sum": 1}}},
        )];
        let request = ReadRequest {
            kind: Some(OperationKind::Aggregate),
            pipeline: Some(&pipeline),
            ..ReadRequest::default()
        };
        let decision = router(true).route_read(&request);
        assert_eq!(decision.backend, BackendKind::Olap);
        assert!(decision.reason.contains("Heavy aggregation"));
        assert_eq!(decision.characteristics.olap_stages, vec!["$group"]);
    }

    #[test]
    fn test_olap_hint_falls_back_when_unconfigured() {
        let request = ReadRequest {
            kind: Some(OperationKind::Find),
            backend_hint: Some(BackendKind::Olap),
            ..ReadRequest::default()
        };
        let decision = router(false).route_read(&request);
        assert_eq!(decision.backend, BackendKind::Oltp);
        assert!(decision.reason.contains("not configured"));
    }

    #[test]
    fn test_unbounded_scan_estimate_exceeds_threshold() {
        let filter = doc! {"status": "active"};
        let request = ReadRequest {
            kind: Some(OperationKind::Find),
            filter: Some(&filter),
            ..ReadRequest::default()
        };
        let decision = router(true).route_read(&request);
        assert_eq!(decision.backend, BackendKind::Olap);
        assert!(decision.characteristics.estimated_rows > 10_000);
    }

    #[test]
    fn test_time_range_query_routes_olap() {
        let filter = doc! {"created_at": {"$gte": 1_700_000_000_i64}, "kind": "event"};
        let request = ReadRequest {
            kind: Some(OperationKind::Find),
            filter: Some(&filter),
            limit: Some(10),
            ..ReadRequest::default()
        };
        let decision = router(true).route_read(&request);
        assert_eq!(decision.backend, BackendKind::Olap);
    }
}
