/*!
 * Aggregation pipeline interpreter for MirageDB
 * Stage-by-stage execution over document streams
 */

use crate::error::{MirageError, Result};
use crate::expression::{evaluate, evaluate_opt, Variables};
use crate::matcher;
use crate::value::{as_number, compare_optional, deep_equal, get_path, set_path, unset_path};
use async_trait::async_trait;
use bson::{Array, Bson, Document};
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::sync::Arc;

/// Fetches foreign collections for `$lookup`. Implemented by the storage
/// boundary; the interpreter never touches storage directly.
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    async fn fetch_collection(&self, db: &str, coll: &str) -> Result<Vec<Document>>;
}

/// External vector-search binding consumed by `$vectorSearch`.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn vector_search(&self, db: &str, coll: &str, params: &Document)
        -> Result<VectorSearchResult>;
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchResult {
    pub doc_ids: Vec<Bson>,
    pub scores: Vec<f64>,
}

/// Execution-time context handed to `execute`.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: String,
    pub collections: Option<Arc<dyn CollectionProvider>>,
    pub vector: Option<Arc<dyn VectorSearch>>,
    pub vars: Variables,
}

impl PipelineContext {
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collections: None,
            vector: None,
            vars: Variables::new(),
        }
    }

    pub fn with_collections(mut self, provider: Arc<dyn CollectionProvider>) -> Self {
        self.collections = Some(provider);
        self
    }

    pub fn with_vector(mut self, vector: Arc<dyn VectorSearch>) -> Self {
        self.vector = Some(vector);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AggregationPipeline {
    stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone)]
pub enum PipelineStage {
    Match(Document),
    Project(Document),
    AddFields(Document),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Count(String),
    Unwind(UnwindOptions),
    Group(GroupOptions),
    Lookup(LookupOptions),
    VectorSearch(Document),
}

#[derive(Debug, Clone)]
pub struct UnwindOptions {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub from: String,
    pub local_field: Option<String>,
    pub foreign_field: Option<String>,
    pub r#as: String,
    pub pipeline: Option<Vec<PipelineStage>>,
    pub let_vars: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub id: Bson,
    pub accumulators: Vec<(String, AccumulatorSpec)>,
}

#[derive(Debug, Clone)]
pub struct AccumulatorSpec {
    pub op: String,
    pub expr: Bson,
}

const GROUP_ACCUMULATORS: [&str; 8] = [
    "$sum", "$avg", "$min", "$max", "$first", "$last", "$push", "$addToSet",
];

/// Stage names the interpreter executes. Heavier stage names still parse
/// at the router (it only reads names), but execution here rejects them.
impl AggregationPipeline {
    pub fn from_bson_array(pipeline: &Array) -> Result<Self> {
        let mut stages = Vec::with_capacity(pipeline.len());
        for stage_value in pipeline {
            let stage_doc = stage_value.as_document().ok_or_else(|| {
                MirageError::InvalidArgument(
                    "pipeline stage must be a document".to_string(),
                )
            })?;
            stages.push(Self::parse_stage(stage_doc)?);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    fn parse_stage(doc: &Document) -> Result<PipelineStage> {
        if doc.len() != 1 {
            return Err(MirageError::InvalidArgument(
                "pipeline stage must have exactly one operator".to_string(),
            ));
        }
        let (stage_name, stage_value) = doc.iter().next().expect("len checked");

        match stage_name.as_str() {
            "$match" => match stage_value {
                Bson::Document(filter) => Ok(PipelineStage::Match(filter.clone())),
                _ => Err(MirageError::InvalidArgument(
                    "$match stage must be a document".to_string(),
                )),
            },
            "$project" => match stage_value {
                Bson::Document(spec) if !spec.is_empty() => {
                    Ok(PipelineStage::Project(spec.clone()))
                }
                _ => Err(MirageError::InvalidArgument(
                    "$project stage must be a non-empty document".to_string(),
                )),
            },
            "$addFields" | "$set" => match stage_value {
                Bson::Document(spec) => Ok(PipelineStage::AddFields(spec.clone())),
                _ => Err(MirageError::InvalidArgument(
                    "$addFields stage must be a document".to_string(),
                )),
            },
            "$sort" => {
                let spec = stage_value.as_document().ok_or_else(|| {
                    MirageError::InvalidArgument("$sort stage must be a document".to_string())
                })?;
                for (key, dir) in spec {
                    match dir_of(dir) {
                        Some(1) | Some(-1) => {}
                        _ => {
                            return Err(MirageError::InvalidArgument(format!(
                                "$sort direction for '{}' must be 1 or -1",
                                key
                            )))
                        }
                    }
                }
                Ok(PipelineStage::Sort(spec.clone()))
            }
            "$limit" => Ok(PipelineStage::Limit(non_negative(stage_value, "$limit")?)),
            "$skip" => Ok(PipelineStage::Skip(non_negative(stage_value, "$skip")?)),
            "$count" => match stage_value {
                Bson::String(field)
                    if !field.is_empty() && !field.starts_with('$') && !field.contains('.') =>
                {
                    Ok(PipelineStage::Count(field.clone()))
                }
                _ => Err(MirageError::InvalidArgument(
                    "$count stage requires a plain field name".to_string(),
                )),
            },
            "$unwind" => Ok(PipelineStage::Unwind(Self::parse_unwind_stage(stage_value)?)),
            "$group" => Ok(PipelineStage::Group(Self::parse_group_stage(stage_value)?)),
            "$lookup" => Ok(PipelineStage::Lookup(Self::parse_lookup_stage(stage_value)?)),
            "$vectorSearch" => match stage_value {
                Bson::Document(params) => Ok(PipelineStage::VectorSearch(params.clone())),
                _ => Err(MirageError::InvalidArgument(
                    "$vectorSearch stage must be a document".to_string(),
                )),
            },
            other => Err(MirageError::InvalidArgument(format!(
                "unsupported pipeline stage: {}",
                other
            ))),
        }
    }

    fn parse_unwind_stage(value: &Bson) -> Result<UnwindOptions> {
        match value {
            Bson::String(path) => Ok(UnwindOptions {
                path: strip_field_prefix(path)?,
                include_array_index: None,
                preserve_null_and_empty_arrays: false,
            }),
            Bson::Document(doc) => {
                let path = doc
                    .get_str("path")
                    .map_err(|_| MirageError::InvalidArgument("$unwind path is required".to_string()))?;
                Ok(UnwindOptions {
                    path: strip_field_prefix(path)?,
                    include_array_index: doc
                        .get_str("includeArrayIndex")
                        .ok()
                        .map(|s| s.to_string()),
                    preserve_null_and_empty_arrays: doc
                        .get_bool("preserveNullAndEmptyArrays")
                        .unwrap_or(false),
                })
            }
            _ => Err(MirageError::InvalidArgument(
                "$unwind stage must be a string or document".to_string(),
            )),
        }
    }

    fn parse_group_stage(value: &Bson) -> Result<GroupOptions> {
        let spec = value.as_document().ok_or_else(|| {
            MirageError::InvalidArgument("$group stage must be a document".to_string())
        })?;
        let id = spec
            .get("_id")
            .cloned()
            .ok_or_else(|| MirageError::InvalidArgument("$group requires _id".to_string()))?;

        let mut accumulators = Vec::new();
        for (field, acc_value) in spec {
            if field == "_id" {
                continue;
            }
            let acc_doc = acc_value.as_document().ok_or_else(|| {
                MirageError::InvalidArgument(format!(
                    "$group field '{}' must be an accumulator document",
                    field
                ))
            })?;
            if acc_doc.len() != 1 {
                return Err(MirageError::InvalidArgument(format!(
                    "$group field '{}' must have exactly one accumulator",
                    field
                )));
            }
            let (op, expr) = acc_doc.iter().next().expect("len checked");
            // $group is a strict context: unknown accumulators fail the stage.
            if !GROUP_ACCUMULATORS.contains(&op.as_str()) {
                return Err(MirageError::InvalidOperation(format!(
                    "unknown group accumulator: {}",
                    op
                )));
            }
            accumulators.push((
                field.clone(),
                AccumulatorSpec {
                    op: op.clone(),
                    expr: expr.clone(),
                },
            ));
        }
        Ok(GroupOptions { id, accumulators })
    }

    fn parse_lookup_stage(value: &Bson) -> Result<LookupOptions> {
        let doc = value.as_document().ok_or_else(|| {
            MirageError::InvalidArgument("$lookup stage must be a document".to_string())
        })?;
        let from = doc
            .get_str("from")
            .map_err(|_| MirageError::InvalidArgument("$lookup from is required".to_string()))?
            .to_string();
        let r#as = doc
            .get_str("as")
            .map_err(|_| MirageError::InvalidArgument("$lookup as is required".to_string()))?
            .to_string();

        let local_field = doc.get_str("localField").ok().map(|s| s.to_string());
        let foreign_field = doc.get_str("foreignField").ok().map(|s| s.to_string());
        let pipeline = doc
            .get_array("pipeline")
            .ok()
            .map(|arr| Self::from_bson_array(arr).map(|p| p.stages))
            .transpose()?;
        let let_vars = doc.get_document("let").ok().cloned();

        if pipeline.is_none() && (local_field.is_none() || foreign_field.is_none()) {
            return Err(MirageError::InvalidArgument(
                "$lookup requires localField/foreignField or a pipeline".to_string(),
            ));
        }

        Ok(LookupOptions {
            from,
            local_field,
            foreign_field,
            r#as,
            pipeline,
            let_vars,
        })
    }

    /// Run the pipeline over `input`. Stages execute in order, each
    /// consuming the previous stage's output.
    pub fn execute(
        &self,
        input: Vec<Document>,
        ctx: PipelineContext,
    ) -> BoxFuture<'_, Result<Vec<Document>>> {
        Box::pin(async move {
            let mut docs = input;
            for (index, stage) in self.stages.iter().enumerate() {
                docs = match stage {
                    PipelineStage::Match(filter) => {
                        docs.retain(|d| matcher::matches(filter, d));
                        docs
                    }
                    PipelineStage::Project(spec) => execute_project(docs, spec, &ctx.vars)?,
                    PipelineStage::AddFields(spec) => execute_add_fields(docs, spec, &ctx.vars)?,
                    PipelineStage::Sort(spec) => execute_sort(docs, spec),
                    PipelineStage::Limit(n) => {
                        docs.truncate(*n as usize);
                        docs
                    }
                    PipelineStage::Skip(n) => {
                        if (*n as usize) < docs.len() {
                            docs.split_off(*n as usize)
                        } else {
                            Vec::new()
                        }
                    }
                    PipelineStage::Count(field) => {
                        let mut count_doc = Document::new();
                        count_doc.insert(field.clone(), docs.len() as i64);
                        vec![count_doc]
                    }
                    PipelineStage::Unwind(opts) => execute_unwind(docs, opts),
                    PipelineStage::Group(opts) => execute_group(docs, opts, &ctx.vars)?,
                    PipelineStage::Lookup(opts) => execute_lookup(docs, opts, &ctx).await?,
                    PipelineStage::VectorSearch(params) => {
                        if index != 0 {
                            return Err(MirageError::InvalidArgument(
                                "$vectorSearch must be the first pipeline stage".to_string(),
                            ));
                        }
                        execute_vector_search(docs, params, &ctx).await?
                    }
                };
            }
            Ok(docs)
        })
    }
}

fn dir_of(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
}

fn non_negative(value: &Bson, stage: &str) -> Result<i64> {
    let n = dir_of(value).ok_or_else(|| {
        MirageError::InvalidArgument(format!("{} stage must be a number", stage))
    })?;
    if n < 0 {
        return Err(MirageError::InvalidArgument(format!(
            "{} must be non-negative",
            stage
        )));
    }
    Ok(n)
}

fn strip_field_prefix(path: &str) -> Result<String> {
    match path.strip_prefix('$') {
        Some(stripped) if !stripped.is_empty() => Ok(stripped.to_string()),
        _ => Err(MirageError::InvalidArgument(format!(
            "field path must start with $: {}",
            path
        ))),
    }
}

fn execute_project(
    docs: Vec<Document>,
    spec: &Document,
    vars: &Variables,
) -> Result<Vec<Document>> {
    enum Mode {
        Include,
        Exclude,
    }

    let has_inclusion = spec.iter().any(|(key, value)| {
        key != "_id" && !matches!(dir_of(value), Some(0)) && !matches!(value, Bson::Boolean(false))
    });
    let mode = if has_inclusion { Mode::Include } else { Mode::Exclude };

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let projected = match mode {
            Mode::Include => {
                let mut result = Document::new();
                // _id rides along unless explicitly excluded.
                let id_excluded = matches!(spec.get("_id"), Some(v) if is_exclusion(v));
                if !id_excluded {
                    if let Some(id) = doc.get("_id") {
                        result.insert("_id", id.clone());
                    }
                }
                for (key, value) in spec {
                    if key == "_id" {
                        if !is_exclusion(value) && !is_inclusion(value) {
                            let computed = evaluate(value, &doc, vars);
                            set_path(&mut result, key, computed)?;
                        }
                        continue;
                    }
                    if is_inclusion(value) {
                        if let Some(found) = get_path(&doc, key) {
                            set_path(&mut result, key, found.clone())?;
                        }
                    } else if !is_exclusion(value) {
                        // Computed field.
                        let computed = evaluate(value, &doc, vars);
                        set_path(&mut result, key, computed)?;
                    }
                }
                result
            }
            Mode::Exclude => {
                let mut result = doc.clone();
                for (key, value) in spec {
                    if is_exclusion(value) {
                        unset_path(&mut result, key)?;
                    }
                }
                result
            }
        };
        out.push(projected);
    }
    Ok(out)
}

fn is_inclusion(value: &Bson) -> bool {
    matches!(dir_of(value), Some(1)) || matches!(value, Bson::Boolean(true))
}

fn is_exclusion(value: &Bson) -> bool {
    matches!(dir_of(value), Some(0)) || matches!(value, Bson::Boolean(false))
}

fn execute_add_fields(
    docs: Vec<Document>,
    spec: &Document,
    vars: &Variables,
) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut result = doc.clone();
        for (path, expr) in spec {
            let value = evaluate(expr, &doc, vars);
            set_path(&mut result, path, value)?;
        }
        out.push(result);
    }
    Ok(out)
}

fn execute_sort(mut docs: Vec<Document>, spec: &Document) -> Vec<Document> {
    // Vec::sort_by is stable: equal keys keep their input order.
    docs.sort_by(|a, b| {
        for (key, dir) in spec {
            let descending = matches!(dir_of(dir), Some(d) if d < 0);
            let mut ord = compare_optional(get_path(a, key), get_path(b, key));
            if descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    docs
}

fn execute_unwind(docs: Vec<Document>, opts: &UnwindOptions) -> Vec<Document> {
    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, &opts.path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for (index, item) in items.into_iter().enumerate() {
                    let mut unwound = doc.clone();
                    let _ = set_path(&mut unwound, &opts.path, item);
                    if let Some(index_field) = &opts.include_array_index {
                        let _ = set_path(&mut unwound, index_field, Bson::Int64(index as i64));
                    }
                    out.push(unwound);
                }
            }
            Some(Bson::Array(_)) | Some(Bson::Null) | None => {
                if opts.preserve_null_and_empty_arrays {
                    let mut kept = doc.clone();
                    let _ = unset_path(&mut kept, &opts.path);
                    if let Some(index_field) = &opts.include_array_index {
                        let _ = set_path(&mut kept, index_field, Bson::Null);
                    }
                    out.push(kept);
                }
            }
            Some(_) => {
                // Non-sequence values pass through as a single element.
                let mut kept = doc.clone();
                if let Some(index_field) = &opts.include_array_index {
                    let _ = set_path(&mut kept, index_field, Bson::Null);
                }
                out.push(kept);
            }
        }
    }
    out
}

struct GroupBucket {
    key: Bson,
    members: Vec<Document>,
}

fn execute_group(
    docs: Vec<Document>,
    opts: &GroupOptions,
    vars: &Variables,
) -> Result<Vec<Document>> {
    // Buckets keep first-seen order; keys compare structurally.
    let mut buckets: Vec<GroupBucket> = Vec::new();
    for doc in docs {
        let key = evaluate(&opts.id, &doc, vars);
        match buckets.iter_mut().find(|b| deep_equal(&b.key, &key)) {
            Some(bucket) => bucket.members.push(doc),
            None => buckets.push(GroupBucket {
                key,
                members: vec![doc],
            }),
        }
    }

    let mut out = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let mut result = Document::new();
        result.insert("_id", bucket.key);
        for (field, spec) in &opts.accumulators {
            let value = accumulate(&spec.op, &spec.expr, &bucket.members, vars)?;
            result.insert(field.clone(), value);
        }
        out.push(result);
    }
    Ok(out)
}

fn accumulate(op: &str, expr: &Bson, members: &[Document], vars: &Variables) -> Result<Bson> {
    match op {
        "$sum" => {
            let mut total = 0.0;
            let mut all_int = true;
            for doc in members {
                let value = evaluate(expr, doc, vars);
                if let Some(n) = as_number(&value) {
                    if matches!(value, Bson::Double(_)) {
                        all_int = false;
                    }
                    total += n;
                }
            }
            Ok(if all_int && total.fract() == 0.0 {
                Bson::Int64(total as i64)
            } else {
                Bson::Double(total)
            })
        }
        "$avg" => {
            let mut total = 0.0;
            let mut count = 0usize;
            for doc in members {
                if let Some(n) = as_number(&evaluate(expr, doc, vars)) {
                    total += n;
                    count += 1;
                }
            }
            Ok(if count == 0 {
                Bson::Null
            } else {
                Bson::Double(total / count as f64)
            })
        }
        "$min" | "$max" => {
            let mut best: Option<Bson> = None;
            for doc in members {
                let value = match evaluate_opt(expr, doc, vars) {
                    Some(v) if !matches!(v, Bson::Null) => v,
                    _ => continue,
                };
                best = Some(match best {
                    None => value,
                    Some(current) => {
                        let ord = crate::value::compare_values(&value, &current);
                        let replace = if op == "$min" {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        };
                        if replace {
                            value
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.unwrap_or(Bson::Null))
        }
        "$first" => Ok(members
            .first()
            .map(|doc| evaluate(expr, doc, vars))
            .unwrap_or(Bson::Null)),
        "$last" => Ok(members
            .last()
            .map(|doc| evaluate(expr, doc, vars))
            .unwrap_or(Bson::Null)),
        "$push" => Ok(Bson::Array(
            members.iter().map(|doc| evaluate(expr, doc, vars)).collect(),
        )),
        "$addToSet" => {
            let mut set: Vec<Bson> = Vec::new();
            for doc in members {
                let value = evaluate(expr, doc, vars);
                if !set.iter().any(|existing| deep_equal(existing, &value)) {
                    set.push(value);
                }
            }
            Ok(Bson::Array(set))
        }
        other => Err(MirageError::InvalidOperation(format!(
            "unknown group accumulator: {}",
            other
        ))),
    }
}

async fn execute_lookup(
    docs: Vec<Document>,
    opts: &LookupOptions,
    ctx: &PipelineContext,
) -> Result<Vec<Document>> {
    let provider = ctx.collections.as_ref().ok_or_else(|| {
        MirageError::InvalidOperation("$lookup requires a collection provider".to_string())
    })?;
    let foreign = provider.fetch_collection(&ctx.db, &opts.from).await?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let joined = match &opts.pipeline {
            Some(stages) => {
                let mut vars = ctx.vars.clone();
                if let Some(let_spec) = &opts.let_vars {
                    for (name, expr) in let_spec {
                        vars.insert(name.clone(), evaluate(expr, &doc, &vars));
                    }
                }
                let sub = AggregationPipeline {
                    stages: stages.clone(),
                };
                let sub_ctx = PipelineContext {
                    db: ctx.db.clone(),
                    collections: ctx.collections.clone(),
                    vector: ctx.vector.clone(),
                    vars,
                };
                sub.execute(foreign.clone(), sub_ctx).await?
            }
            None => {
                let local_field = opts.local_field.as_deref().expect("validated at parse");
                let foreign_field = opts.foreign_field.as_deref().expect("validated at parse");
                let local = get_path(&doc, local_field).cloned().unwrap_or(Bson::Null);
                foreign
                    .iter()
                    .filter(|f| {
                        let fv = get_path(f, foreign_field).cloned().unwrap_or(Bson::Null);
                        lookup_values_match(&local, &fv)
                    })
                    .cloned()
                    .collect()
            }
        };
        let mut result = doc;
        set_path(
            &mut result,
            &opts.r#as,
            Bson::Array(joined.into_iter().map(Bson::Document).collect()),
        )?;
        out.push(result);
    }
    Ok(out)
}

/// Equality with array broadcast on both sides, as $lookup joins do.
fn lookup_values_match(local: &Bson, foreign: &Bson) -> bool {
    let locals: Vec<&Bson> = match local {
        Bson::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    let foreigns: Vec<&Bson> = match foreign {
        Bson::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    locals
        .iter()
        .any(|l| foreigns.iter().any(|f| deep_equal(l, f)))
}

async fn execute_vector_search(
    docs: Vec<Document>,
    params: &Document,
    ctx: &PipelineContext,
) -> Result<Vec<Document>> {
    let binding = ctx.vector.as_ref().ok_or_else(|| {
        MirageError::InvalidOperation("AI binding required for $vectorSearch".to_string())
    })?;
    let coll = params.get_str("index").unwrap_or_default().to_string();
    let result = binding.vector_search(&ctx.db, &coll, params).await?;

    // Order by the backend's ranking; annotate each hit with its score.
    let mut out = Vec::new();
    for (rank, id) in result.doc_ids.iter().enumerate() {
        if let Some(found) = docs
            .iter()
            .find(|d| d.get("_id").map(|v| deep_equal(v, id)).unwrap_or(false))
        {
            let mut hit = found.clone();
            if let Some(score) = result.scores.get(rank) {
                hit.insert("searchScore", Bson::Double(*score));
            }
            out.push(hit);
        }
    }
    Ok(out)
}
